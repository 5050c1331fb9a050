//! Color selection and its wire token
//!
//! The payload on the wire is exactly the UTF-8 bytes of the lowercase
//! color name. No framing, no length prefix, no version byte.

use std::fmt;
use std::str::FromStr;

use crate::{ShutterError, ShutterResult};

/// A color a peer can select and broadcast
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColorSelection {
    Red,
    Green,
    Blue,
}

impl ColorSelection {
    /// All selections in display order
    pub const ALL: [ColorSelection; 3] = [
        ColorSelection::Red,
        ColorSelection::Green,
        ColorSelection::Blue,
    ];

    /// Canonical lowercase token
    pub fn as_str(self) -> &'static str {
        match self {
            ColorSelection::Red => "red",
            ColorSelection::Green => "green",
            ColorSelection::Blue => "blue",
        }
    }

    /// Wire payload
    #[inline]
    pub fn encode(self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    /// Parse a wire payload. Anything but an exact token is rejected.
    pub fn decode(payload: &[u8]) -> ShutterResult<Self> {
        match payload {
            b"red" => Ok(ColorSelection::Red),
            b"green" => Ok(ColorSelection::Green),
            b"blue" => Ok(ColorSelection::Blue),
            other => Err(ShutterError::UnknownColorToken(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    /// Display tint as (r, g, b)
    pub fn rgb(self) -> (u8, u8, u8) {
        match self {
            ColorSelection::Red => (255, 0, 0),
            ColorSelection::Green => (0, 255, 0),
            ColorSelection::Blue => (0, 0, 255),
        }
    }
}

impl fmt::Display for ColorSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColorSelection {
    type Err = ShutterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s.as_bytes())
    }
}
