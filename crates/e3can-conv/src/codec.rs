//! The closed codec family
//!
//! Every DID in a catalog names one of these codecs. Resolving the textual
//! spec to a `Codec` variant happens at catalog load, which is where a typo
//! or an inconsistent length should blow up - not in the decode hot path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::descriptor::CodecArgs;
use crate::error::{ConvError, ConvResult};
use crate::precision::to_json_number;

/// Byte order for multi-byte values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Most significant byte first - the UDS default
    #[default]
    Big,
    /// Least significant byte first - used by a handful of E3 data points
    Little,
}

/// A named field inside a [`Codec::Struct`]
#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    pub name: String,
    pub codec: Codec,
}

/// One codec out of the closed family.
///
/// `decode` turns exactly `declared_len()` raw bytes into a JSON value,
/// `encode` is its inverse for writable DIDs.
#[derive(Debug, Clone, PartialEq)]
pub enum Codec {
    /// Scaled integer, 1-8 bytes
    Int {
        bytes: u8,
        signed: bool,
        scale: f64,
        byte_order: ByteOrder,
    },
    /// IEEE 754 float, 4 or 8 bytes
    Float { bytes: u8, byte_order: ByteOrder },
    /// NUL-padded UTF-8 text
    Utf8 { len: u16 },
    /// Discrete value with a label table
    Mapping { bytes: u8, map: BTreeMap<u32, String> },
    /// Nested record of named fields; drives the hierarchical tree view
    Struct { fields: Vec<StructField> },
    /// Hex passthrough
    Raw { len: u16 },
}

impl Codec {
    /// Resolve a textual codec spec into a validated variant.
    pub fn from_spec(name: &str, len: u16, args: &CodecArgs) -> ConvResult<Codec> {
        match name {
            "int" => {
                if !(1..=8).contains(&len) {
                    return Err(ConvError::InvalidSpec(format!(
                        "int length must be 1..=8, got {}",
                        len
                    )));
                }
                let scale = args.scale.unwrap_or(1.0);
                if scale <= 0.0 {
                    return Err(ConvError::InvalidSpec(format!(
                        "int scale must be positive, got {}",
                        scale
                    )));
                }
                Ok(Codec::Int {
                    bytes: len as u8,
                    signed: args.signed.unwrap_or(false),
                    scale,
                    byte_order: args.byte_order.unwrap_or_default(),
                })
            }
            "float" => {
                if len != 4 && len != 8 {
                    return Err(ConvError::InvalidSpec(format!(
                        "float length must be 4 or 8, got {}",
                        len
                    )));
                }
                Ok(Codec::Float {
                    bytes: len as u8,
                    byte_order: args.byte_order.unwrap_or_default(),
                })
            }
            "utf8" => {
                if len == 0 {
                    return Err(ConvError::InvalidSpec("utf8 length must be non-zero".into()));
                }
                Ok(Codec::Utf8 { len })
            }
            "mapping" => {
                if !(1..=4).contains(&len) {
                    return Err(ConvError::InvalidSpec(format!(
                        "mapping length must be 1..=4, got {}",
                        len
                    )));
                }
                let map = args.map.clone().ok_or(ConvError::MissingArg {
                    codec: "mapping",
                    arg: "map",
                })?;
                Ok(Codec::Mapping {
                    bytes: len as u8,
                    map,
                })
            }
            "struct" => {
                let raw_fields = args.fields.as_ref().ok_or(ConvError::MissingArg {
                    codec: "struct",
                    arg: "fields",
                })?;
                if raw_fields.is_empty() {
                    return Err(ConvError::InvalidSpec("struct has no fields".into()));
                }
                let mut fields = Vec::with_capacity(raw_fields.len());
                for f in raw_fields {
                    fields.push(StructField {
                        name: f.name.clone(),
                        codec: Codec::from_spec(&f.codec, f.len, &f.args)?,
                    });
                }
                let sum: u16 = fields.iter().map(|f| f.codec.declared_len()).sum();
                if sum != len {
                    return Err(ConvError::InvalidSpec(format!(
                        "struct fields cover {} bytes but length is {}",
                        sum, len
                    )));
                }
                Ok(Codec::Struct { fields })
            }
            "raw" => Ok(Codec::Raw { len }),
            other => Err(ConvError::UnknownCodec(other.to_string())),
        }
    }

    /// The codec's registry name.
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Int { .. } => "int",
            Codec::Float { .. } => "float",
            Codec::Utf8 { .. } => "utf8",
            Codec::Mapping { .. } => "mapping",
            Codec::Struct { .. } => "struct",
            Codec::Raw { .. } => "raw",
        }
    }

    /// Number of raw bytes this codec covers.
    pub fn declared_len(&self) -> u16 {
        match self {
            Codec::Int { bytes, .. } => *bytes as u16,
            Codec::Float { bytes, .. } => *bytes as u16,
            Codec::Utf8 { len } => *len,
            Codec::Mapping { bytes, .. } => *bytes as u16,
            Codec::Struct { fields } => fields.iter().map(|f| f.codec.declared_len()).sum(),
            Codec::Raw { len } => *len,
        }
    }

    /// Flattened `(codec-name, length)` pairs, recursing through structs.
    ///
    /// Two catalog generations describe the same storage layout for a DID
    /// exactly when their signatures are equal.
    pub fn signature(&self) -> Vec<(String, u16)> {
        let mut out = Vec::new();
        self.collect_signature(&mut out);
        out
    }

    fn collect_signature(&self, out: &mut Vec<(String, u16)>) {
        match self {
            Codec::Struct { fields } => {
                for f in fields {
                    f.codec.collect_signature(out);
                }
            }
            other => out.push((other.name().to_string(), other.declared_len())),
        }
    }

    /// Decode raw bytes into a JSON value.
    pub fn decode(&self, data: &[u8]) -> ConvResult<Value> {
        match self {
            Codec::Int {
                bytes,
                signed,
                scale,
                byte_order,
            } => {
                let raw = read_uint(data, *bytes, *byte_order)?;
                if *scale == 1.0 {
                    if *signed {
                        Ok(json!(sign_extend(raw, *bytes)))
                    } else {
                        Ok(json!(raw))
                    }
                } else {
                    let v = if *signed {
                        sign_extend(raw, *bytes) as f64
                    } else {
                        raw as f64
                    };
                    Ok(to_json_number(v * scale, *scale))
                }
            }
            Codec::Float { bytes, byte_order } => {
                check_len(data, *bytes as usize)?;
                let v = match (*bytes, byte_order) {
                    (4, ByteOrder::Big) => {
                        f32::from_be_bytes(data[..4].try_into().unwrap()) as f64
                    }
                    (4, ByteOrder::Little) => {
                        f32::from_le_bytes(data[..4].try_into().unwrap()) as f64
                    }
                    (8, ByteOrder::Big) => f64::from_be_bytes(data[..8].try_into().unwrap()),
                    (8, ByteOrder::Little) => f64::from_le_bytes(data[..8].try_into().unwrap()),
                    _ => unreachable!("float width validated at load"),
                };
                Ok(json!(v))
            }
            Codec::Utf8 { len } => {
                let n = (*len as usize).min(data.len());
                let s = String::from_utf8_lossy(&data[..n])
                    .trim_end_matches('\0')
                    .to_string();
                Ok(json!(s))
            }
            Codec::Mapping { bytes, map } => {
                let raw = read_uint(data, *bytes, ByteOrder::Big)? as u32;
                Ok(json!({
                    "value": raw,
                    "label": map.get(&raw),
                }))
            }
            Codec::Struct { fields } => {
                check_len(data, self.declared_len() as usize)?;
                let mut obj = Map::new();
                let mut offset = 0usize;
                for field in fields {
                    let n = field.codec.declared_len() as usize;
                    obj.insert(field.name.clone(), field.codec.decode(&data[offset..offset + n])?);
                    offset += n;
                }
                Ok(Value::Object(obj))
            }
            Codec::Raw { .. } => Ok(json!(hex::encode(data))),
        }
    }

    /// Encode a JSON value back into raw bytes.
    pub fn encode(&self, value: &Value) -> ConvResult<Vec<u8>> {
        match self {
            Codec::Int {
                bytes,
                signed,
                scale,
                byte_order,
            } => {
                let phys = value
                    .as_f64()
                    .ok_or_else(|| ConvError::InvalidData("int expects a number".into()))?;
                let raw_f = (phys / scale).round();
                let raw = if *signed {
                    let (min, max) = signed_range(*bytes);
                    if raw_f < min as f64 || raw_f > max as f64 {
                        return Err(ConvError::ValueOutOfRange {
                            value: phys,
                            bytes: *bytes,
                        });
                    }
                    (raw_f as i64 as u64) & width_mask(*bytes)
                } else {
                    let max = width_mask(*bytes);
                    if raw_f < 0.0 || raw_f > max as f64 {
                        return Err(ConvError::ValueOutOfRange {
                            value: phys,
                            bytes: *bytes,
                        });
                    }
                    raw_f as u64
                };
                Ok(write_uint(raw, *bytes, *byte_order))
            }
            Codec::Float { bytes, byte_order } => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| ConvError::InvalidData("float expects a number".into()))?;
                Ok(match (*bytes, byte_order) {
                    (4, ByteOrder::Big) => (v as f32).to_be_bytes().to_vec(),
                    (4, ByteOrder::Little) => (v as f32).to_le_bytes().to_vec(),
                    (8, ByteOrder::Big) => v.to_be_bytes().to_vec(),
                    (8, ByteOrder::Little) => v.to_le_bytes().to_vec(),
                    _ => unreachable!("float width validated at load"),
                })
            }
            Codec::Utf8 { len } => {
                let s = value
                    .as_str()
                    .ok_or_else(|| ConvError::InvalidData("utf8 expects a string".into()))?;
                if s.len() > *len as usize {
                    return Err(ConvError::InvalidData(format!(
                        "string of {} bytes exceeds field length {}",
                        s.len(),
                        len
                    )));
                }
                let mut bytes = s.as_bytes().to_vec();
                bytes.resize(*len as usize, 0);
                Ok(bytes)
            }
            Codec::Mapping { bytes, map } => {
                let raw = match value {
                    Value::Number(n) => n
                        .as_u64()
                        .ok_or_else(|| ConvError::InvalidData("mapping expects an unsigned value".into()))?,
                    Value::String(label) => map
                        .iter()
                        .find(|(_, l)| l.as_str() == label)
                        .map(|(v, _)| *v as u64)
                        .ok_or_else(|| {
                            ConvError::InvalidData(format!("unknown mapping label: {}", label))
                        })?,
                    Value::Object(obj) => obj
                        .get("value")
                        .and_then(Value::as_u64)
                        .ok_or_else(|| ConvError::InvalidData("mapping object lacks `value`".into()))?,
                    _ => return Err(ConvError::InvalidData("cannot encode mapping value".into())),
                };
                if raw > width_mask(*bytes) {
                    return Err(ConvError::ValueOutOfRange {
                        value: raw as f64,
                        bytes: *bytes,
                    });
                }
                Ok(write_uint(raw, *bytes, ByteOrder::Big))
            }
            Codec::Struct { fields } => {
                let obj = value
                    .as_object()
                    .ok_or_else(|| ConvError::InvalidData("struct expects an object".into()))?;
                let mut bytes = Vec::with_capacity(self.declared_len() as usize);
                for field in fields {
                    let v = obj.get(&field.name).ok_or_else(|| {
                        ConvError::InvalidData(format!("missing struct field: {}", field.name))
                    })?;
                    bytes.extend(field.codec.encode(v)?);
                }
                Ok(bytes)
            }
            Codec::Raw { len } => {
                let s = value
                    .as_str()
                    .ok_or_else(|| ConvError::InvalidData("raw expects a hex string".into()))?;
                let bytes = hex::decode(s)
                    .map_err(|_| ConvError::InvalidData(format!("invalid hex string: {}", s)))?;
                if bytes.len() != *len as usize {
                    return Err(ConvError::DataTooShort {
                        expected: *len as usize,
                        actual: bytes.len(),
                    });
                }
                Ok(bytes)
            }
        }
    }
}

fn check_len(data: &[u8], required: usize) -> ConvResult<()> {
    if data.len() < required {
        Err(ConvError::DataTooShort {
            expected: required,
            actual: data.len(),
        })
    } else {
        Ok(())
    }
}

fn read_uint(data: &[u8], bytes: u8, order: ByteOrder) -> ConvResult<u64> {
    let n = bytes as usize;
    check_len(data, n)?;
    let mut raw = 0u64;
    match order {
        ByteOrder::Big => {
            for &b in &data[..n] {
                raw = (raw << 8) | b as u64;
            }
        }
        ByteOrder::Little => {
            for &b in data[..n].iter().rev() {
                raw = (raw << 8) | b as u64;
            }
        }
    }
    Ok(raw)
}

fn write_uint(raw: u64, bytes: u8, order: ByteOrder) -> Vec<u8> {
    let n = bytes as usize;
    let mut out = vec![0u8; n];
    for (i, slot) in out.iter_mut().enumerate() {
        let shift = match order {
            ByteOrder::Big => 8 * (n - 1 - i),
            ByteOrder::Little => 8 * i,
        };
        *slot = (raw >> shift) as u8;
    }
    out
}

fn sign_extend(raw: u64, bytes: u8) -> i64 {
    let shift = 64 - 8 * bytes as u32;
    ((raw << shift) as i64) >> shift
}

fn width_mask(bytes: u8) -> u64 {
    if bytes >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * bytes)) - 1
    }
}

fn signed_range(bytes: u8) -> (i64, i64) {
    let bits = 8 * bytes as u32;
    if bits >= 64 {
        (i64::MIN, i64::MAX)
    } else {
        (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_codec(bytes: u8, signed: bool, scale: f64) -> Codec {
        Codec::Int {
            bytes,
            signed,
            scale,
            byte_order: ByteOrder::Big,
        }
    }

    #[test]
    fn test_int_decode_scaled() {
        let codec = int_codec(2, true, 0.1);
        // 0x01C2 = 450 -> 45.0 degrees
        assert_eq!(codec.decode(&[0x01, 0xC2]).unwrap(), json!(45));
        // negative: -15 raw -> -1.5
        assert_eq!(codec.decode(&[0xFF, 0xF1]).unwrap(), json!(-1.5));
    }

    #[test]
    fn test_int_round_trip() {
        let codec = int_codec(2, true, 0.1);
        for raw in [[0x01u8, 0xC2], [0xFF, 0xF1], [0x00, 0x00], [0x7F, 0xFF]] {
            let value = codec.decode(&raw).unwrap();
            assert_eq!(codec.encode(&value).unwrap(), raw.to_vec());
        }
    }

    #[test]
    fn test_int_little_endian() {
        let codec = Codec::Int {
            bytes: 2,
            signed: false,
            scale: 1.0,
            byte_order: ByteOrder::Little,
        };
        assert_eq!(codec.decode(&[0x34, 0x12]).unwrap(), json!(0x1234));
        assert_eq!(codec.encode(&json!(0x1234)).unwrap(), vec![0x34, 0x12]);
    }

    #[test]
    fn test_int_encode_out_of_range() {
        let codec = int_codec(1, false, 1.0);
        assert!(matches!(
            codec.encode(&json!(300)),
            Err(ConvError::ValueOutOfRange { .. })
        ));
        assert!(matches!(
            codec.encode(&json!(-1)),
            Err(ConvError::ValueOutOfRange { .. })
        ));
    }

    #[test]
    fn test_utf8_round_trip() {
        let codec = Codec::Utf8 { len: 8 };
        assert_eq!(
            codec.decode(b"VITOCAL\0").unwrap(),
            json!("VITOCAL")
        );
        assert_eq!(
            codec.encode(&json!("VITOCAL")).unwrap(),
            b"VITOCAL\0".to_vec()
        );
    }

    #[test]
    fn test_mapping() {
        let map = BTreeMap::from([(0, "Off".to_string()), (2, "Heating".to_string())]);
        let codec = Codec::Mapping { bytes: 1, map };

        let v = codec.decode(&[2]).unwrap();
        assert_eq!(v["value"], json!(2));
        assert_eq!(v["label"], json!("Heating"));

        assert_eq!(codec.encode(&json!("Heating")).unwrap(), vec![2]);
        assert_eq!(codec.encode(&json!(0)).unwrap(), vec![0]);
        assert_eq!(codec.encode(&v).unwrap(), vec![2]);
    }

    #[test]
    fn test_struct_decode() {
        let codec = Codec::Struct {
            fields: vec![
                StructField {
                    name: "Actual".to_string(),
                    codec: int_codec(2, true, 0.1),
                },
                StructField {
                    name: "Setpoint".to_string(),
                    codec: int_codec(2, true, 0.1),
                },
            ],
        };
        assert_eq!(codec.declared_len(), 4);

        let v = codec.decode(&[0x01, 0xC2, 0x00, 0xE6]).unwrap();
        assert_eq!(v["Actual"], json!(45));
        assert_eq!(v["Setpoint"], json!(23));

        assert_eq!(codec.encode(&v).unwrap(), vec![0x01, 0xC2, 0x00, 0xE6]);
    }

    #[test]
    fn test_raw_round_trip() {
        let codec = Codec::Raw { len: 3 };
        let v = codec.decode(&[0xAB, 0xCD, 0xEF]).unwrap();
        assert_eq!(v, json!("abcdef"));
        assert_eq!(codec.encode(&v).unwrap(), vec![0xAB, 0xCD, 0xEF]);
    }

    #[test]
    fn test_signature_flattens_structs() {
        let codec = Codec::Struct {
            fields: vec![
                StructField {
                    name: "a".to_string(),
                    codec: int_codec(2, false, 1.0),
                },
                StructField {
                    name: "b".to_string(),
                    codec: Codec::Struct {
                        fields: vec![StructField {
                            name: "c".to_string(),
                            codec: Codec::Utf8 { len: 4 },
                        }],
                    },
                },
            ],
        };
        assert_eq!(
            codec.signature(),
            vec![("int".to_string(), 2), ("utf8".to_string(), 4)]
        );
    }

    #[test]
    fn test_from_spec_validates() {
        let args = CodecArgs::default();
        assert!(Codec::from_spec("int", 2, &args).is_ok());
        assert!(matches!(
            Codec::from_spec("int", 9, &args),
            Err(ConvError::InvalidSpec(_))
        ));
        assert!(matches!(
            Codec::from_spec("mapping", 1, &args),
            Err(ConvError::MissingArg { .. })
        ));
        assert!(matches!(
            Codec::from_spec("bogus", 1, &args),
            Err(ConvError::UnknownCodec(_))
        ));
    }
}
