//! Insteon PowerLinc Modem framing
//!
//! Only the standard direct message is needed: ON at a level, or OFF.
//!
//! ```text
//! 02 62 | A1 A2 A3 | flags | cmd1 | cmd2
//!  PLM  |  device  |  0F   | 11/13| level (0-255)
//! ```

use std::fmt;

/// Start of every PLM command
const PLM_START: u8 = 0x02;
/// Send INSTEON standard or extended message
const PLM_SEND: u8 = 0x62;
/// Direct message, max hops 3
const STD_FLAGS: u8 = 0x0F;

const CMD_ON: u8 = 0x11;
const CMD_OFF: u8 = 0x13;

/// Three byte device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InsteonAddress(pub [u8; 3]);

impl InsteonAddress {
    /// Parse dotted hex ("42.22.B8"); a ":button" suffix is ignored
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.split(':').next()?.trim();
        let mut bytes = [0u8; 3];
        let mut parts = text.split('.');
        for byte in bytes.iter_mut() {
            let part = parts.next()?;
            if part.is_empty() || part.len() > 2 {
                return None;
            }
            *byte = u8::from_str_radix(part, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for InsteonAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}.{:02X}.{:02X}", self.0[0], self.0[1], self.0[2])
    }
}

/// Percent (0-100) to the device's 0-255 scale, rounding half up
pub fn percent_to_raw(percent: u8) -> u8 {
    let percent = u16::from(percent.min(100));
    ((percent * 255 + 50) / 100) as u8
}

/// Set a dimmer to a level in percent; 0 is sent as OFF
pub fn set_level_frame(address: InsteonAddress, percent: u8) -> Vec<u8> {
    let level = percent_to_raw(percent);
    let cmd1 = if level == 0 { CMD_OFF } else { CMD_ON };
    let [a1, a2, a3] = address.0;
    vec![PLM_START, PLM_SEND, a1, a2, a3, STD_FLAGS, cmd1, level]
}
