//! Utils Module
pub mod telemetry;
pub mod truncate;

pub use truncate::truncate_text;
