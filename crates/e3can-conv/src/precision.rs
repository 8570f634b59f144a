//! Floating point precision handling
//!
//! Keeps scaled values clean: a 0.1-degree sensor should publish 21.5,
//! not 21.500000000000004.

/// Determine appropriate decimal places from a scale factor
pub fn precision_from_scale(scale: f64) -> u8 {
    if scale <= 0.0 {
        return 4;
    }

    let abs_scale = scale.abs();
    if abs_scale >= 1.0 {
        return 0;
    }

    // Multiply by 10 until the scale is (close enough to) an integer.
    let mut temp = abs_scale;
    let mut precision = 0u8;
    while precision < 6 {
        if (temp - temp.round()).abs() < 1e-9 {
            break;
        }
        temp *= 10.0;
        precision += 1;
    }

    precision
}

/// Round a value to the given number of decimal places
pub fn round_to_precision(value: f64, precision: u8) -> f64 {
    if precision == 0 {
        value.round()
    } else {
        let factor = 10_f64.powi(precision as i32);
        (value * factor).round() / factor
    }
}

/// Format a scaled value as a clean JSON number
///
/// Integral results come out as JSON integers.
pub fn to_json_number(value: f64, scale: f64) -> serde_json::Value {
    let rounded = round_to_precision(value, precision_from_scale(scale));

    if (rounded - rounded.round()).abs() < f64::EPSILON {
        let int_val = rounded.round() as i64;
        if (int_val as f64 - rounded).abs() < f64::EPSILON {
            return serde_json::json!(int_val);
        }
    }

    serde_json::json!(rounded)
}
