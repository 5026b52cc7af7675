//! Valid-choice vocabularies for string devices.

use crate::error::{ScpiError, ScpiResult};

/// A set of SCPI mnemonics with short/long form matching.
///
/// Each entry is declared in the documentation convention where the
/// mandatory short form is written in capitals: `"FIXed"` accepts `FIX`,
/// `FIXED` and any case variant of either, exactly as instruments do.
/// Intermediate truncations (`FIXE`) are rejected.
#[derive(Debug, Clone)]
pub struct ChoiceStrings {
    entries: Vec<Mnemonic>,
}

#[derive(Debug, Clone)]
struct Mnemonic {
    /// As declared, e.g. `FIXed`.
    declared: String,
    /// Uppercase letters of the declared form, e.g. `FIX`.
    short: String,
    /// Whole declared form uppercased, e.g. `FIXED`.
    long: String,
}

impl Mnemonic {
    fn new(declared: &str) -> Self {
        // Compound mnemonics keep their separators in the short form
        // ("VOLTage:AC" -> "VOLT:AC").
        let short: String = declared.chars().filter(|c| !c.is_ascii_lowercase()).collect();
        let long = declared.to_ascii_uppercase();
        let short = if short.is_empty() { long.clone() } else { short };
        Self {
            declared: declared.to_string(),
            short,
            long,
        }
    }

    fn matches(&self, candidate: &str) -> bool {
        // Only the exact short or the exact long form, case-insensitively.
        let c = candidate.trim().to_ascii_uppercase();
        c == self.short || c == self.long
    }
}

impl ChoiceStrings {
    /// Build from declared mnemonics (`["FIXed", "LIST", "SWEep"]`).
    pub fn new<I, S>(mnemonics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entries: mnemonics
                .into_iter()
                .map(|m| Mnemonic::new(m.as_ref()))
                .collect(),
        }
    }

    /// Whether `candidate` matches any entry.
    pub fn contains(&self, candidate: &str) -> bool {
        self.entries.iter().any(|m| m.matches(candidate))
    }

    /// Map `candidate` to its declared form, or error with the full
    /// vocabulary.
    pub fn normalize(&self, candidate: &str) -> ScpiResult<String> {
        self.entries
            .iter()
            .find(|m| m.matches(candidate))
            .map(|m| m.declared.clone())
            .ok_or_else(|| ScpiError::InvalidChoice {
                device: String::new(),
                value: candidate.to_string(),
                allowed: self.declared(),
            })
    }

    /// All declared forms, for error messages and docs.
    pub fn declared(&self) -> Vec<String> {
        self.entries.iter().map(|m| m.declared.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_forms_match() {
        let c = ChoiceStrings::new(["FIXed", "LIST", "SWEep"]);
        for ok in ["FIX", "fix", "FIXED", "Fixed", "LIST", "swe", "SWEEP"] {
            assert!(c.contains(ok), "{ok} should match");
        }
        for bad in ["FI", "FIXE", "FIXEDX", "SW", "SWEE", "step"] {
            assert!(!c.contains(bad), "{bad} should not match");
        }
    }

    #[test]
    fn normalize_returns_declared_form() {
        let c = ChoiceStrings::new(["DBM", "W", "VOLTage"]);
        assert_eq!(c.normalize("dbm").unwrap(), "DBM");
        assert_eq!(c.normalize("volt").unwrap(), "VOLTage");
        assert_eq!(c.normalize("VOLTAGE").unwrap(), "VOLTage");
        let err = c.normalize("amps").unwrap_err();
        assert!(matches!(err, ScpiError::InvalidChoice { .. }));
    }

    #[test]
    fn plain_uppercase_requires_exact_form() {
        let c = ChoiceStrings::new(["IMMediate", "BUS", "EXTernal"]);
        assert!(c.contains("IMM"));
        assert!(c.contains("immediate"));
        assert!(c.contains("BUS"));
        assert!(!c.contains("BU"));
    }
}
