//! Various utilities functions and types

mod geometry;
mod timestamp;

pub use self::geometry::{Logical, Point};
pub use self::timestamp::Timestamp;
