//! Library crate for recon-scan-rs exposing the scanning, detection,
//! metrics and benchmarking modules.
pub mod benchmark;
pub mod detect;
pub mod metrics;
pub mod ports;
pub mod probe;
pub mod scanner;
pub mod server;
pub mod types;
