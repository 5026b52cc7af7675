//! Conversion between Rust values and SCPI text.

use crate::error::{ScpiError, ScpiResult};

/// A value that can cross the SCPI text boundary.
///
/// `as_f64` feeds numeric limit checks; non-numeric types leave the default
/// `None` and are never range-checked.
pub trait ScpiType: Sized + Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Human-readable type name for error messages.
    const NAME: &'static str;

    /// Format for transmission.
    fn to_scpi(&self) -> String;

    /// Parse an instrument reply.
    fn from_scpi(s: &str) -> ScpiResult<Self>;

    /// Numeric view for limit checking.
    fn as_f64(&self) -> Option<f64> {
        None
    }
}

fn parse_err(s: &str, wanted: &'static str) -> ScpiError {
    ScpiError::ParseResponse {
        text: s.to_string(),
        wanted,
    }
}

impl ScpiType for bool {
    const NAME: &'static str = "bool";

    fn to_scpi(&self) -> String {
        if *self { "1" } else { "0" }.to_string()
    }

    fn from_scpi(s: &str) -> ScpiResult<Self> {
        let t = s.trim();
        if t.eq_ignore_ascii_case("ON") || t.eq_ignore_ascii_case("TRUE") {
            return Ok(true);
        }
        if t.eq_ignore_ascii_case("OFF") || t.eq_ignore_ascii_case("FALSE") {
            return Ok(false);
        }
        // Numeric form, possibly float-formatted ("+1.0").
        let v: f64 = t.parse().map_err(|_| parse_err(s, Self::NAME))?;
        Ok(v != 0.0)
    }
}

impl ScpiType for f64 {
    const NAME: &'static str = "f64";

    fn to_scpi(&self) -> String {
        format!("{self}")
    }

    fn from_scpi(s: &str) -> ScpiResult<Self> {
        s.trim().parse().map_err(|_| parse_err(s, Self::NAME))
    }

    fn as_f64(&self) -> Option<f64> {
        Some(*self)
    }
}

impl ScpiType for i64 {
    const NAME: &'static str = "i64";

    fn to_scpi(&self) -> String {
        format!("{self}")
    }

    fn from_scpi(s: &str) -> ScpiResult<Self> {
        // Instruments often answer integer queries in float notation.
        let v: f64 = s.trim().parse().map_err(|_| parse_err(s, Self::NAME))?;
        Ok(v.round() as i64)
    }

    fn as_f64(&self) -> Option<f64> {
        Some(*self as f64)
    }
}

impl ScpiType for u32 {
    const NAME: &'static str = "u32";

    fn to_scpi(&self) -> String {
        format!("{self}")
    }

    fn from_scpi(s: &str) -> ScpiResult<Self> {
        let v = i64::from_scpi(s)?;
        u32::try_from(v).map_err(|_| parse_err(s, Self::NAME))
    }

    fn as_f64(&self) -> Option<f64> {
        Some(f64::from(*self))
    }
}

impl ScpiType for usize {
    const NAME: &'static str = "usize";

    fn to_scpi(&self) -> String {
        format!("{self}")
    }

    fn from_scpi(s: &str) -> ScpiResult<Self> {
        let v = i64::from_scpi(s)?;
        usize::try_from(v).map_err(|_| parse_err(s, Self::NAME))
    }

    fn as_f64(&self) -> Option<f64> {
        Some(*self as f64)
    }
}

impl ScpiType for String {
    const NAME: &'static str = "string";

    fn to_scpi(&self) -> String {
        self.clone()
    }

    fn from_scpi(s: &str) -> ScpiResult<Self> {
        Ok(s.trim().to_string())
    }
}

/// Wrap a string in SCPI double quotes.
pub fn quote(s: &str) -> String {
    format!("\"{s}\"")
}

/// Strip one layer of surrounding single or double quotes, if present.
pub fn unquote(s: &str) -> &str {
    let t = s.trim();
    for q in ['"', '\''] {
        if t.len() >= 2 && t.starts_with(q) && t.ends_with(q) {
            return &t[1..t.len() - 1];
        }
    }
    t
}

/// Split a comma-separated SCPI list, trimming each field.
pub fn split_csv(s: &str) -> Vec<&str> {
    s.split(',').map(str::trim).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_round_trip() {
        assert_eq!(true.to_scpi(), "1");
        assert_eq!(false.to_scpi(), "0");
        assert!(bool::from_scpi("1").unwrap());
        assert!(bool::from_scpi("+1.0").unwrap());
        assert!(bool::from_scpi("ON").unwrap());
        assert!(bool::from_scpi("True").unwrap());
        assert!(!bool::from_scpi("off").unwrap());
        assert!(!bool::from_scpi("False").unwrap());
        assert!(!bool::from_scpi("0").unwrap());
        assert!(bool::from_scpi("maybe").is_err());
    }

    #[test]
    fn floats_parse_scientific() {
        assert_eq!(f64::from_scpi("+1.000000E+09").unwrap(), 1e9);
        assert_eq!(f64::from_scpi(" -3.5 ").unwrap(), -3.5);
        assert!(f64::from_scpi("9.91E37garbage").is_err());
    }

    #[test]
    fn integers_accept_float_notation() {
        assert_eq!(i64::from_scpi("+401.0").unwrap(), 401);
        assert_eq!(usize::from_scpi("1601").unwrap(), 1601);
        assert!(usize::from_scpi("-1").is_err());
    }

    #[test]
    fn quoting_helpers() {
        assert_eq!(quote("abc"), "\"abc\"");
        assert_eq!(unquote("\"abc\""), "abc");
        assert_eq!(unquote("'abc'"), "abc");
        assert_eq!(unquote("abc"), "abc");
        assert_eq!(split_csv("a, b ,c"), vec!["a", "b", "c"]);
    }
}
