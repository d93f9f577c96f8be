//! Socket and connection management.
//!
//! - [`connection`]: per-connection protocol state machine and read loop
//! - [`pool`]: connection groups, service points, idle eviction
//! - [`connectjob`]: TCP connect, CONNECT tunnel, pluggable TLS
//! - [`proxy`]: proxy settings and failover chain
//! - [`returnresult`]: completions delivered outside the connection lock

pub mod authcache;
pub mod client;
pub mod connectjob;
pub mod connection;
pub mod pool;
pub mod proxy;
pub mod returnresult;
pub mod stream;
