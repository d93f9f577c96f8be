//! Request objects and the loop that drives them.
//!
//! - [`request`]: the shared [`Request`](request::Request) and its completion sink
//! - [`job`]: retries, redirects and auth round trips across legs
//! - [`context`]: engine configuration and process-wide registry

pub mod context;
pub mod job;
pub mod request;

pub use context::{EngineConfig, URLRequestContext};
pub use request::{Request, RequestOptions};
