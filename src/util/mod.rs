//! Small self-contained helpers shared by both filesystem engines.

pub mod bitmap;

pub use bitmap::BitMap;
