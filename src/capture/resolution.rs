//! Snapping requested resolutions onto what the camera hardware offers

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pick the supported size closest to `requested`.
///
/// An exact match wins; otherwise the size with the smallest absolute area
/// difference, earliest entry on ties. An empty list leaves the request as is.
pub fn nearest_supported(supported: &[Size], requested: Size) -> Size {
    if supported.contains(&requested) {
        return requested;
    }

    supported
        .iter()
        .copied()
        .min_by_key(|size| size.area().abs_diff(requested.area()))
        .unwrap_or(requested)
}
