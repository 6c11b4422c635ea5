pub mod annotate;
pub mod capture;
pub mod config;
pub mod endpoints;
pub mod inferer;
pub mod meter;
pub mod motion;
pub mod nn;
pub mod pose;
pub mod recognizer;
pub mod reporter;
pub mod scene;
pub mod source;
pub mod utils;

/// Capacity of the annotated frames channel, lagging viewers skip frames beyond it.
pub const FEED_CHANNEL_CAPACITY: usize = 4;
