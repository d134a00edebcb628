//! Euclidean distance over a point shared with C.
//!
//! `Point` is laid out exactly like
//!
//! ```c
//! struct point {
//!     int x;
//!     int y;
//! };
//! ```
//!
//! so a C caller can pass `struct point *` straight into [`dist`].

use std::ffi::{c_double, c_int};

use serde::{Deserialize, Serialize};

/// A point on the integer plane.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: c_int,
    pub y: c_int,
}

impl Point {
    pub const fn new(x: c_int, y: c_int) -> Self {
        Self { x, y }
    }

    /// Distance to `other`. Differences are taken in `i64` so the full
    /// `c_int` range is accepted.
    pub fn distance_to(&self, other: &Point) -> f64 {
        let dx = (i64::from(self.x) - i64::from(other.x)) as f64;
        let dy = (i64::from(self.y) - i64::from(other.y)) as f64;
        dx.hypot(dy)
    }
}

/// Euclidean distance between two points.
///
/// A null pointer on either side yields NaN.
#[unsafe(no_mangle)]
pub extern "C" fn dist(p1: Option<&Point>, p2: Option<&Point>) -> c_double {
    match (p1, p2) {
        (Some(p1), Some(p2)) => p1.distance_to(p2),
        _ => {
            tracing::warn!("dist called with a null point");
            c_double::NAN
        }
    }
}

/// Formats a distance the way the host entry point prints it.
pub fn format_distance(distance: f64, precision: usize) -> String {
    format!("{distance:.precision$}")
}
