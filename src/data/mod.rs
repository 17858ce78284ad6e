//! Line aggregation, fitting and persistence.
pub mod aggregator;
pub mod fit;
pub mod rolling;
pub mod storage;
