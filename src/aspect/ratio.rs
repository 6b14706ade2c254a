//! Aspect ratio values
//!
//! Ratios arrive as text from three places: the player ("1.78"), IMDb
//! ("2.39 : 1") and the user ("2.35"). They are normalized to hundredths so
//! two ratios compare exactly.

use crate::error::EventError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const FLAT_HUNDREDTHS: u16 = 185;
const SCOPE_HUNDREDTHS: u16 = 235;

/// Aspect ratio of a title
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AspectRatio {
    /// 1.85:1
    Flat,
    /// 2.35:1
    Scope,
    /// Any other explicit ratio, in hundredths (2.39:1 is `Other(239)`)
    Other(u16),
    /// No usable ratio
    Unknown,
}

impl AspectRatio {
    /// Build a ratio from its numeric value
    pub fn from_value(value: f64) -> Self {
        if !value.is_finite() || value <= 0.0 || value > 100.0 {
            return AspectRatio::Unknown;
        }
        Self::from_hundredths((value * 100.0).round() as u16)
    }

    pub fn from_hundredths(hundredths: u16) -> Self {
        match hundredths {
            0 => AspectRatio::Unknown,
            FLAT_HUNDREDTHS => AspectRatio::Flat,
            SCOPE_HUNDREDTHS => AspectRatio::Scope,
            h => AspectRatio::Other(h),
        }
    }

    /// Ratio in hundredths, `None` for `Unknown`
    pub fn hundredths(&self) -> Option<u16> {
        match self {
            AspectRatio::Flat => Some(FLAT_HUNDREDTHS),
            AspectRatio::Scope => Some(SCOPE_HUNDREDTHS),
            AspectRatio::Other(h) => Some(*h),
            AspectRatio::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, AspectRatio::Unknown)
    }

    /// Parse the loose forms seen in the wild: `2.35`, `2.35:1`,
    /// `2.39 : 1`, `16:9`. Returns `None` when no number can be found.
    pub fn parse_loose(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if text.eq_ignore_ascii_case("unknown") {
            return Some(AspectRatio::Unknown);
        }

        let mut parts = text.splitn(2, ':');
        let lhs: f64 = parts.next()?.trim().parse().ok()?;
        let value = match parts.next() {
            Some(rhs) => {
                let rhs: f64 = rhs.trim().parse().ok()?;
                if rhs <= 0.0 {
                    return None;
                }
                lhs / rhs
            }
            None => lhs,
        };

        Some(Self::from_value(value))
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hundredths() {
            Some(h) => write!(f, "{}.{:02}", h / 100, h % 100),
            None => write!(f, "unknown"),
        }
    }
}

impl FromStr for AspectRatio {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_loose(s).ok_or_else(|| EventError::BadRatio(s.to_string()))
    }
}

impl TryFrom<String> for AspectRatio {
    type Error = EventError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AspectRatio> for String {
    fn from(ratio: AspectRatio) -> Self {
        ratio.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!("2.35".parse::<AspectRatio>().unwrap(), AspectRatio::Scope);
        assert_eq!("1.85:1".parse::<AspectRatio>().unwrap(), AspectRatio::Flat);
        assert_eq!(
            " 2.39 : 1 ".parse::<AspectRatio>().unwrap(),
            AspectRatio::Other(239)
        );
        assert_eq!("16:9".parse::<AspectRatio>().unwrap(), AspectRatio::Other(178));
        assert_eq!("unknown".parse::<AspectRatio>().unwrap(), AspectRatio::Unknown);
        assert_eq!("0".parse::<AspectRatio>().unwrap(), AspectRatio::Unknown);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<AspectRatio>().is_err());
        assert!("wide".parse::<AspectRatio>().is_err());
        assert!("2.35:0".parse::<AspectRatio>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(AspectRatio::Flat.to_string(), "1.85");
        assert_eq!(AspectRatio::Other(240).to_string(), "2.40");
        assert_eq!(AspectRatio::Other(133).to_string(), "1.33");
        assert_eq!(AspectRatio::Unknown.to_string(), "unknown");
    }

    #[test]
    fn test_serde_as_string() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            ratio: AspectRatio,
        }

        let w: Wrapper = toml::from_str("ratio = \"2.35\"").unwrap();
        assert_eq!(w.ratio, AspectRatio::Scope);
        assert_eq!(toml::to_string(&w).unwrap().trim(), "ratio = \"2.35\"");
    }
}
