//! Base types and error handling.
//!
//! Provides the foundational types shared by every layer:
//! - [`NetError`](neterror::NetError): network error codes, Chromium numbering where one exists
//! - [`FailureClass`](neterror::FailureClass): how the resubmit loop treats a failure
//! - [`LoadState`](loadstate::LoadState): where a request is in its submission cycle

pub mod context;
pub mod loadstate;
pub mod neterror;

#[cfg(test)]
mod tests;
