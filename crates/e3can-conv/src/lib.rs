//! e3can-conv - DID codec pipeline for the e3can adapter
//!
//! Turns raw UDS payload bytes into structured values and back, driven by
//! versioned catalog files that describe every data identifier (DID) a
//! device exposes.
//!
//! The codec family is a closed enum: catalog loading resolves the textual
//! codec spec into a [`Codec`] variant up front, so a bad catalog fails at
//! boot instead of at decode time.

pub mod catalog;
pub mod codec;
pub mod descriptor;
pub mod error;
pub mod precision;

pub use catalog::{version_cmp, CatalogMeta, DidCatalog, TYPE_FIX_VERSION, VARIABLE_LENGTH_DIDS};
pub use codec::{ByteOrder, Codec, StructField};
pub use descriptor::{CodecArgs, DidDescriptor, RawDescriptor};
pub use error::{format_did, parse_did, ConvError, ConvResult};
