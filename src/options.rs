//! Architecture startup options.
//!
//! Each architecture declares the named options it understands as a table of
//! descriptors. The external option parser matches names against the table,
//! prints the help strings, and hands raw integer values back here for range
//! validation.

use core::fmt::Write as _;

use serde::Serialize;

use crate::error::OptionError;

/// One architecture-specific startup option.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ArchOption {
    /// Long option name, without leading dashes.
    pub name: &'static str,
    /// Help text for the parser's usage output.
    pub help: &'static str,
    /// Smallest accepted value.
    pub min: i64,
    /// Largest accepted value.
    pub max: i64,
    /// Whether the value must also be a power of two.
    pub power_of_two: bool,
}

impl ArchOption {
    /// Validate a raw value against this descriptor.
    pub fn validate(&self, value: i64) -> Result<i64, OptionError> {
        if value < self.min || value > self.max {
            return Err(OptionError::OutOfRange {
                name: self.name,
                value,
                min: self.min,
                max: self.max,
            });
        }
        if self.power_of_two && value & (value - 1) != 0 {
            return Err(OptionError::NotPowerOfTwo {
                name: self.name,
                value,
            });
        }
        Ok(value)
    }
}

/// Render an option table as usage lines for the external parser's help
/// output.
pub fn usage(options: &[ArchOption]) -> String {
    let mut out = String::new();
    for opt in options {
        let flag = format!("--{}=<n>", opt.name);
        let _ = writeln!(out, "  {:<22} {}", flag, opt.help);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPT: ArchOption = ArchOption {
        name: "test-vq",
        help: "Compare vector registers with the given VQ",
        min: 1,
        max: 16,
        power_of_two: false,
    };

    const POW2_OPT: ArchOption = ArchOption {
        name: "test-tiles",
        help: "Compare tile storage with the given VQ",
        min: 1,
        max: 16,
        power_of_two: true,
    };

    #[test]
    fn accepts_values_in_range() {
        assert_eq!(OPT.validate(1), Ok(1));
        assert_eq!(OPT.validate(16), Ok(16));
        assert_eq!(OPT.validate(7), Ok(7));
    }

    #[test]
    fn rejects_values_outside_range() {
        assert!(matches!(
            OPT.validate(0),
            Err(OptionError::OutOfRange { value: 0, .. })
        ));
        assert!(matches!(
            OPT.validate(17),
            Err(OptionError::OutOfRange { value: 17, .. })
        ));
        assert!(matches!(
            OPT.validate(-3),
            Err(OptionError::OutOfRange { value: -3, .. })
        ));
    }

    #[test]
    fn power_of_two_constraint() {
        assert_eq!(POW2_OPT.validate(4), Ok(4));
        assert_eq!(POW2_OPT.validate(16), Ok(16));
        assert!(matches!(
            POW2_OPT.validate(6),
            Err(OptionError::NotPowerOfTwo { value: 6, .. })
        ));
    }

    #[test]
    fn usage_lists_every_option() {
        let text = usage(&[OPT, POW2_OPT]);
        assert!(text.contains("--test-vq=<n>"), "usage was: {text}");
        assert!(text.contains("Compare tile storage"), "usage was: {text}");
        assert_eq!(text.lines().count(), 2);
    }
}
