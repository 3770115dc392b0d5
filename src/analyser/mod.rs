//! Congestion-control fingerprinting of TCP captures.
//! Reconstructs bytes in flight per flow, cuts growth cycles out of it and reduces each one to a
//! polynomial that Gaussian models can score.
pub mod containers;
pub mod core;
pub mod fit;
pub mod model;
pub mod segment;
pub mod shape;
pub mod tracker;
pub mod utils;
