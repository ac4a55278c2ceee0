pub mod cache;
pub mod encode;
pub mod ht;
pub mod region;
pub mod ttl;

pub use cache::{DnsCache, SWEEP_INTERVAL};
