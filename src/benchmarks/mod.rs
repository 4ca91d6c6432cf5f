//! Criterion benchmarks, compiled only with the `benchmarks` feature.

pub mod resolution;
