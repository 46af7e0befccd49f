use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{FacadeError, Result};

/// Bytes per pixel of the fixed BGRA layout every device produces.
pub const BYTES_PER_PIXEL: usize = 4;

/// Inclusive bounds accepted for a device format. Both the property surface
/// and the desired-state reconciler validate against [`FormatBounds::CANONICAL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatBounds {
    pub min_dimension: u32,
    pub max_dimension: u32,
    pub min_frame_rate: u32,
    pub max_frame_rate: u32,
}

impl FormatBounds {
    pub const CANONICAL: FormatBounds = FormatBounds {
        min_dimension: 16,
        max_dimension: 8192,
        min_frame_rate: 10,
        max_frame_rate: 120,
    };

    pub fn dimension_in_range(&self, value: u32) -> bool {
        (self.min_dimension..=self.max_dimension).contains(&value)
    }

    pub fn frame_rate_in_range(&self, value: u32) -> bool {
        (self.min_frame_rate..=self.max_frame_rate).contains(&value)
    }

    pub fn contains(&self, format: &VideoFormat) -> bool {
        self.dimension_in_range(format.width)
            && self.dimension_in_range(format.height)
            && self.frame_rate_in_range(format.frame_rate)
    }
}

/// Width and height of a frame, rendered as `"{width}x{height}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Dimensions {
    type Err = FacadeError;

    fn from_str(value: &str) -> Result<Self> {
        let (width, height) = value
            .split_once('x')
            .ok_or_else(|| FacadeError::msg(format!("`{value}` is not of the form WxH")))?;
        let width = width
            .trim()
            .parse()
            .map_err(|_| FacadeError::msg(format!("invalid width in `{value}`")))?;
        let height = height
            .trim()
            .parse()
            .map_err(|_| FacadeError::msg(format!("invalid height in `{value}`")))?;
        Ok(Self { width, height })
    }
}

/// Pixel format of a device: dimensions plus the nominal frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for VideoFormat {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            frame_rate: 60,
        }
    }
}

impl VideoFormat {
    pub fn new(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            width,
            height,
            frame_rate,
        }
    }

    /// Returns the format unchanged if it lies within the canonical bounds.
    pub fn validated(self) -> Result<Self> {
        if FormatBounds::CANONICAL.contains(&self) {
            Ok(self)
        } else {
            Err(FacadeError::InvalidFormat {
                width: self.width,
                height: self.height,
                frame_rate: self.frame_rate,
            })
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width,
            height: self.height,
        }
    }

    pub fn with_dimensions(self, dimensions: Dimensions) -> Self {
        Self {
            width: dimensions.width,
            height: dimensions.height,
            ..self
        }
    }

    /// Size in bytes of one BGRA frame.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    /// Nominal time between two frames.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.frame_rate.max(1)))
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.frame_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_bounds_are_inclusive() {
        assert!(VideoFormat::new(16, 16, 10).validated().is_ok());
        assert!(VideoFormat::new(8192, 8192, 120).validated().is_ok());
        assert!(VideoFormat::new(15, 16, 10).validated().is_err());
        assert!(VideoFormat::new(16, 8193, 10).validated().is_err());
        assert!(VideoFormat::new(16, 16, 9).validated().is_err());
        assert!(VideoFormat::new(16, 16, 121).validated().is_err());
    }

    #[test]
    fn dimensions_round_trip_through_text() {
        let dims: Dimensions = "1280x720".parse().unwrap();
        assert_eq!(dims, Dimensions { width: 1280, height: 720 });
        assert_eq!(dims.to_string(), "1280x720");
        assert!("1280by720".parse::<Dimensions>().is_err());
        assert!("x720".parse::<Dimensions>().is_err());
    }

    #[test]
    fn frame_geometry_follows_bgra_layout() {
        let format = VideoFormat::new(640, 480, 30);
        assert_eq!(format.frame_len(), 640 * 480 * 4);
        assert_eq!(format.frame_interval(), Duration::from_nanos(33_333_333));
    }
}
