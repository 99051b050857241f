//! Device capability tags.
//!
//! A peer's device type decides which value vocabulary it speaks and which
//! client-side handler a Block attaches to its connection. The numeric tag
//! travels in the `register` handshake line.

use serde::Serialize;

use crate::error::ProtoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u16)]
pub enum DeviceType {
    Generic = 0,
    Telescope = 1,
    Camera = 2,
    Dome = 3,
    Cupola = 4,
    Photometer = 5,
    FilterWheel = 6,
    Focuser = 7,
    Mirror = 8,
    Executor = 9,
    ImageProcessor = 10,
    Selector = 11,
    GrbReceiver = 12,
}

impl DeviceType {
    pub fn from_u16(v: u16) -> Result<Self, ProtoError> {
        match v {
            0 => Ok(DeviceType::Generic),
            1 => Ok(DeviceType::Telescope),
            2 => Ok(DeviceType::Camera),
            3 => Ok(DeviceType::Dome),
            4 => Ok(DeviceType::Cupola),
            5 => Ok(DeviceType::Photometer),
            6 => Ok(DeviceType::FilterWheel),
            7 => Ok(DeviceType::Focuser),
            8 => Ok(DeviceType::Mirror),
            9 => Ok(DeviceType::Executor),
            10 => Ok(DeviceType::ImageProcessor),
            11 => Ok(DeviceType::Selector),
            12 => Ok(DeviceType::GrbReceiver),
            other => Err(ProtoError::UnknownDeviceType(other)),
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Generic => "generic",
            DeviceType::Telescope => "telescope",
            DeviceType::Camera => "camera",
            DeviceType::Dome => "dome",
            DeviceType::Cupola => "cupola",
            DeviceType::Photometer => "photometer",
            DeviceType::FilterWheel => "filter-wheel",
            DeviceType::Focuser => "focuser",
            DeviceType::Mirror => "mirror",
            DeviceType::Executor => "executor",
            DeviceType::ImageProcessor => "image-processor",
            DeviceType::Selector => "selector",
            DeviceType::GrbReceiver => "grb-receiver",
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip() {
        for ty in [
            DeviceType::Telescope,
            DeviceType::Camera,
            DeviceType::GrbReceiver,
            DeviceType::Generic,
        ] {
            assert_eq!(DeviceType::from_u16(ty.as_u16()).unwrap(), ty);
        }
        assert!(DeviceType::from_u16(99).is_err());
    }
}
