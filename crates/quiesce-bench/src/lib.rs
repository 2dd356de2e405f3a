//! Benchmark crate for quiesce; see `benches/`.
