//! SSE2 128-bit packed-lane instructions (§4.4).

pub mod lanes;

pub use lanes::*;
