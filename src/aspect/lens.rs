//! Lens-memory table and projector command encoding
//!
//! The projector stores optical presets in numbered lens-memory slots. A
//! ratio selects one of five bands, and each band is bound to a slot in the
//! configuration.

use super::AspectRatio;
use crate::serial::DeviceJob;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Start of text
const STX: u8 = 0x02;
/// End of text
const ETX: u8 = 0x03;
/// Lens memory load command body, followed by the 5-digit slot number
const LENS_MEMORY_LOAD: &str = "VXX:LMLI0=+";

/// Highest lens-memory slot the projector exposes
pub const MAX_LENS_SLOT: u8 = 5;

/// Ratio bands, narrowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LensBand {
    /// Up to 1.60 (4:3 and 1.37 academy)
    Academy,
    /// Up to 1.80 (16:9)
    Hdtv,
    /// Below 2.00 (1.85:1)
    Flat,
    /// Below 2.37 (2.35:1)
    Scope,
    /// 2.37 and wider (2.39:1, 2.40:1)
    Ultra,
}

impl LensBand {
    pub fn for_ratio(ratio: AspectRatio) -> Option<Self> {
        let h = ratio.hundredths()?;
        let band = if h <= 160 {
            LensBand::Academy
        } else if h <= 180 {
            LensBand::Hdtv
        } else if h < 200 {
            LensBand::Flat
        } else if h < 237 {
            LensBand::Scope
        } else {
            LensBand::Ultra
        };
        Some(band)
    }
}

impl fmt::Display for LensBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LensBand::Academy => write!(f, "4:3"),
            LensBand::Hdtv => write!(f, "16:9"),
            LensBand::Flat => write!(f, "1.85:1"),
            LensBand::Scope => write!(f, "2.35:1"),
            LensBand::Ultra => write!(f, "2.40:1"),
        }
    }
}

/// Band to lens-memory slot bindings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LensMap {
    pub academy: u8,
    pub hdtv: u8,
    pub flat: u8,
    pub scope: u8,
    pub ultra: u8,
}

impl Default for LensMap {
    fn default() -> Self {
        Self {
            academy: 0,
            hdtv: 1,
            flat: 2,
            scope: 3,
            ultra: 4,
        }
    }
}

impl LensMap {
    pub fn slot(&self, band: LensBand) -> u8 {
        match band {
            LensBand::Academy => self.academy,
            LensBand::Hdtv => self.hdtv,
            LensBand::Flat => self.flat,
            LensBand::Scope => self.scope,
            LensBand::Ultra => self.ultra,
        }
    }

    /// Command for a ratio; `Unknown` has none
    pub fn command_for(&self, ratio: AspectRatio) -> Option<LensCommand> {
        LensBand::for_ratio(ratio).map(|band| LensCommand {
            slot: self.slot(band),
        })
    }

    /// Every slot, for validation
    pub fn slots(&self) -> [(&'static str, u8); 5] {
        [
            ("academy", self.academy),
            ("hdtv", self.hdtv),
            ("flat", self.flat),
            ("scope", self.scope),
            ("ultra", self.ultra),
        ]
    }
}

/// Lens-memory load command for one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LensCommand {
    pub slot: u8,
}

impl LensCommand {
    pub fn new(slot: u8) -> Self {
        Self { slot }
    }

    /// Wire bytes: `STX VXX:LMLI0=+0000N ETX`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(18);
        frame.push(STX);
        frame.extend_from_slice(LENS_MEMORY_LOAD.as_bytes());
        frame.extend_from_slice(format!("{:05}", self.slot).as_bytes());
        frame.push(ETX);
        frame
    }
}

impl DeviceJob for LensCommand {
    fn frames(&self) -> Vec<Vec<u8>> {
        vec![self.to_bytes()]
    }
}

impl fmt::Display for LensCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lens memory {}", self.slot)
    }
}
