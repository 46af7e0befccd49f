//! Typed property surface of devices and of the provider.
//!
//! Every property the host can query or set is a variant of a closed enum, so
//! the get/set dispatch is checked for exhaustiveness at compile time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DeviceId, Dimensions};

/// Identification string exposed by every device and by the provider.
pub const MAGIC_VALUE: &str = "Facade by Paal Maxima";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    Virtual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DevicePropertyKey {
    Magic,
    Uid,
    Name,
    Dimensions,
    FrameRate,
    TransportType,
    Model,
}

impl DevicePropertyKey {
    pub const ALL: [DevicePropertyKey; 7] = [
        DevicePropertyKey::Magic,
        DevicePropertyKey::Uid,
        DevicePropertyKey::Name,
        DevicePropertyKey::Dimensions,
        DevicePropertyKey::FrameRate,
        DevicePropertyKey::TransportType,
        DevicePropertyKey::Model,
    ];

    /// Four-character code used when talking to the host.
    pub fn code(&self) -> &'static str {
        match self {
            DevicePropertyKey::Magic => "fmag",
            DevicePropertyKey::Uid => "fuid",
            DevicePropertyKey::Name => "fnam",
            DevicePropertyKey::Dimensions => "fdim",
            DevicePropertyKey::FrameRate => "frat",
            DevicePropertyKey::TransportType => "tran",
            DevicePropertyKey::Model => "modl",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.code() == code)
    }
}

/// Value of one device property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceProperty {
    Magic(&'static str),
    Uid(DeviceId),
    Name(String),
    Dimensions(Dimensions),
    FrameRate(u32),
    TransportType(TransportType),
    Model(String),
}

impl DeviceProperty {
    pub fn key(&self) -> DevicePropertyKey {
        match self {
            DeviceProperty::Magic(_) => DevicePropertyKey::Magic,
            DeviceProperty::Uid(_) => DevicePropertyKey::Uid,
            DeviceProperty::Name(_) => DevicePropertyKey::Name,
            DeviceProperty::Dimensions(_) => DevicePropertyKey::Dimensions,
            DeviceProperty::FrameRate(_) => DevicePropertyKey::FrameRate,
            DeviceProperty::TransportType(_) => DevicePropertyKey::TransportType,
            DeviceProperty::Model(_) => DevicePropertyKey::Model,
        }
    }

    /// Wire encoding handed to the host: NUL-terminated UTF-8 for strings,
    /// four little-endian bytes for the frame rate.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            DeviceProperty::FrameRate(rate) => rate.to_le_bytes().to_vec(),
            DeviceProperty::TransportType(TransportType::Virtual) => {
                u32::from_be_bytes(*b"virt").to_le_bytes().to_vec()
            }
            other => {
                let mut bytes = other.to_string().into_bytes();
                bytes.push(0);
                bytes
            }
        }
    }
}

impl fmt::Display for DeviceProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProperty::Magic(magic) => f.write_str(magic),
            DeviceProperty::Uid(id) => write!(f, "{id}"),
            DeviceProperty::Name(name) | DeviceProperty::Model(name) => f.write_str(name),
            DeviceProperty::Dimensions(dimensions) => write!(f, "{dimensions}"),
            DeviceProperty::FrameRate(rate) => write!(f, "{rate}"),
            DeviceProperty::TransportType(TransportType::Virtual) => f.write_str("virtual"),
        }
    }
}

/// Settable subset of the device properties, as received from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyUpdate {
    /// `"{width}x{height}"`.
    Dimensions(String),
    FrameRate(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderPropertyKey {
    Name,
    Manufacturer,
    Magic,
    State,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderProperty {
    Name(String),
    Manufacturer(String),
    Magic(&'static str),
    /// Current desired-state document.
    State(String),
}

impl ProviderProperty {
    pub fn key(&self) -> ProviderPropertyKey {
        match self {
            ProviderProperty::Name(_) => ProviderPropertyKey::Name,
            ProviderProperty::Manufacturer(_) => ProviderPropertyKey::Manufacturer,
            ProviderProperty::Magic(_) => ProviderPropertyKey::Magic,
            ProviderProperty::State(_) => ProviderPropertyKey::State,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique_and_reversible() {
        for key in DevicePropertyKey::ALL {
            assert_eq!(DevicePropertyKey::from_code(key.code()), Some(key));
        }
        assert_eq!(DevicePropertyKey::from_code("zzzz"), None);
    }

    #[test]
    fn encodes_values_for_the_host() {
        assert_eq!(DeviceProperty::FrameRate(60).to_bytes(), vec![60, 0, 0, 0]);
        assert_eq!(
            DeviceProperty::Dimensions(Dimensions { width: 640, height: 480 }).to_bytes(),
            b"640x480\0".to_vec()
        );
        assert_eq!(
            DeviceProperty::Magic(MAGIC_VALUE).key(),
            DevicePropertyKey::Magic
        );
    }
}
