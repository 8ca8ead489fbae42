//! Hardware backends. Each is feature-gated so the crate builds and tests on
//! machines without the corresponding system libraries.

#[cfg(feature = "capture")]
pub mod frame;
#[cfg(feature = "pulse")]
pub mod pulse;
