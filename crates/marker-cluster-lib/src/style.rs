//! Device-relative sizing and the cluster bubble style handed to the renderer
//!
//! Sizes are expressed in percent of the display (`w(3.0)` is 3% of the width) so that the
//! same configuration looks alike on small and large screens.

use crate::{ClusterError, PixelDimensions, Result};
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Physical size of the display the map is drawn on
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DisplayMetrics {
    pub width_px: f64,
    pub height_px: f64,
}

impl Default for DisplayMetrics {
    fn default() -> Self {
        Self {
            width_px: 1080.0,
            height_px: 1920.0,
        }
    }
}

impl DisplayMetrics {
    pub fn new(width_px: f64, height_px: f64) -> Self {
        Self {
            width_px,
            height_px,
        }
    }

    /// `percent` of the display width, in pixels
    #[inline]
    pub fn w(&self, percent: f64) -> f64 {
        self.width_px * percent / 100.0
    }

    /// `percent` of the display height, in pixels
    #[inline]
    pub fn h(&self, percent: f64) -> f64 {
        self.height_px * percent / 100.0
    }

    /// Diagonal-based unit used for text: `num` fiftieths of the half-screen diagonal
    pub fn total_size(&self, num: f64) -> f64 {
        let half_width = self.w(50.0);
        let half_height = self.h(50.0);
        (half_width * half_width + half_height * half_height).sqrt() * num / 50.0
    }

    /// Pixel dimensions used to turn a viewport into a zoom level
    ///
    /// Half the physical size with the axes exchanged: the width is half the display
    /// height and the height is half the display width.
    pub fn reference_dimensions(&self) -> PixelDimensions {
        PixelDimensions::new(self.h(50.0), self.w(50.0))
    }

    /// Clustering radius in pixels: 3% of the display width
    pub fn cluster_radius(&self) -> f64 {
        self.w(3.0)
    }
}

/// An opaque 24-bit color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl FromStr for Rgb {
    type Err = ClusterError;

    /// Parse `#RRGGBB` or `RRGGBB`
    fn from_str(s: &str) -> Result<Self> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        let invalid = || ClusterError::InvalidOptions {
            reason: format!("'{s}' is not a #RRGGBB color"),
        };

        if hex.len() != 6 || !hex.is_ascii() {
            return Err(invalid());
        }
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16).map_err(|_| invalid())
        };

        Ok(Self::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Presentation of a cluster bubble, consumed by the external renderer
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClusterStyle {
    /// Bubble fill
    pub cluster_color: Rgb,
    /// Count label color
    pub text_color: Rgb,
    pub border_color: Rgb,
    pub border_width: f64,
    /// Count label size in pixels
    pub text_size: f64,
    /// Bubble diameter in pixels
    pub bubble_size: f64,
    pub corner_radius: f64,
    pub bold_text: bool,
}

impl ClusterStyle {
    /// Default style sized for `metrics`
    pub fn for_display(metrics: &DisplayMetrics) -> Self {
        Self {
            cluster_color: Rgb::new(0xF5, 0xF5, 0xF5),
            text_color: Rgb::new(0xFF, 0x52, 0x52),
            border_color: Rgb::new(0xFF, 0x52, 0x52),
            border_width: 1.0,
            text_size: metrics.total_size(1.8),
            bubble_size: metrics.w(10.0),
            corner_radius: metrics.w(10.0),
            bold_text: true,
        }
    }
}

impl Default for ClusterStyle {
    fn default() -> Self {
        Self::for_display(&DisplayMetrics::default())
    }
}

/// Short label for a cluster's point count: `999`, `1.2k`, `15k`
pub fn abbreviate_count(count: usize) -> String {
    if count >= 10_000 {
        format!("{}k", (count as f64 / 1000.0).round())
    } else if count >= 1000 {
        format!("{}k", (count as f64 / 100.0).round() / 10.0)
    } else {
        count.to_string()
    }
}
