//! HTTP/1.x protocol layer.
//!
//! Parsing ([`statusline`], [`headerparser`], [`framer`], [`chunked`]),
//! request serialization ([`requesthead`], [`requestbody`]), one leg of a
//! request ([`transaction`]) and the seams around it ([`auth`], [`cache`],
//! [`retry`]).

pub mod auth;
pub mod cache;
pub mod chunked;
pub mod continuegate;
pub mod framer;
pub mod headerparser;
pub mod requestbody;
pub mod requesthead;
pub mod response;
pub mod responsebody;
pub mod retry;
pub mod statusline;
pub mod transaction;

// Re-exports for convenience
pub use requestbody::RequestBody;
pub use response::HttpResponse;
pub use responsebody::ResponseBody;
