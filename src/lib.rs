//! # wirenet
//!
//! An HTTP/1.1 client protocol engine.
//!
//! `wirenet` owns everything between "send this request" and "here is the
//! response": matching requests to pooled connections, serializing heads
//! and bodies, pipelining, incremental response parsing, the
//! `100-continue` handshake, and the resubmit loop for redirects,
//! authentication challenges and retryable failures.
//!
//! ## Features
//!
//! - **Connection Pooling**: 6 connections per group, least-busy selection, idle eviction
//! - **Pipelining**: FIFO response association with back-pressure at 10 in flight
//! - **Framing**: Content-Length, chunked and close-delimited bodies, streamed or buffered
//! - **Expect: 100-continue**: with a timer fallback and per-origin memory
//! - **Redirects & Auth**: method rewriting, credential stripping, pluggable auth schemes
//! - **Proxy Support**: HTTP proxies with failover and CONNECT tunnels
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wirenet::Client;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = Client::new();
//!     let response = client.get("http://example.com").send().await.unwrap();
//!     println!("Status: {}", response.status());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Core types and error definitions
//! - [`http`] - Parsers, framing, request legs
//! - [`socket`] - Connections, pooling, proxies
//! - [`urlrequest`] - Requests, configuration, the resubmit loop
//! - [`blocking`] - Synchronous client

pub mod base;
pub mod blocking;
pub mod client;
pub mod http;
pub mod socket;
pub mod urlrequest;

pub use base::neterror::NetError;
pub use client::{Client, ClientBuilder, RequestBuilder};
pub use crate::http::{HttpResponse, RequestBody, ResponseBody};
pub use urlrequest::{EngineConfig, Request};
