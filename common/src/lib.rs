//! Common code shared between `presence_server` and the services consuming its output.
pub mod presence;
pub mod roster;

/// Label of a face that matches no known employee.
pub const UNKNOWN: &str = "Unknown";
