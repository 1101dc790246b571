pub mod aggregator;
pub mod classifier;
pub mod counters;
pub mod interfaces;
pub mod manager;
pub mod source;
