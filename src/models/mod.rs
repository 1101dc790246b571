pub mod config;
pub mod flow;
pub mod interface;
pub mod sample;
pub mod session;
