pub mod cli;
pub mod config;
pub mod error;
pub mod ffi;
pub mod geometry;
pub mod header;
pub mod layout;
pub mod manifest;
pub mod ownership;
pub mod telemetry;

pub use error::{InteropError, InteropResult, InteropStatus};
pub use geometry::{Point, dist};
pub use layout::BoundaryContract;
pub use manifest::BoundaryManifest;
pub use ownership::{CellRegistry, Destructor, Origin, OwnedCell, Release, make_memory, take_ownership};
