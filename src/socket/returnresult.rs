//! Deferred completions.
//!
//! Connection code decides outcomes while holding its state lock but must
//! not run completion sinks there. It collects them in a
//! [`ConnectionReturnResult`] and delivers after the lock is released.

use crate::base::neterror::{NetError, RequestFailure};
use crate::urlrequest::request::{CoreResponse, Request};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

struct Completion {
    request: Arc<Request>,
    leg: u64,
    outcome: CoreResponse,
}

/// Completions waiting to be delivered, in order.
#[derive(Default)]
pub struct ConnectionReturnResult {
    completions: Vec<Completion>,
}

impl std::fmt::Debug for ConnectionReturnResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.completions.iter().map(|c| c.request.id())).finish()
    }
}

impl ConnectionReturnResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.completions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completions.is_empty()
    }

    /// Queue one completion. A request may appear only once.
    pub fn add(&mut self, request: &Arc<Request>, leg: u64, outcome: CoreResponse) -> Result<(), NetError> {
        if self.completions.iter().any(|c| c.request.id() == request.id()) {
            tracing::warn!(request = request.id(), "duplicate completion dropped");
            return Err(NetError::DuplicateCompletion);
        }
        self.completions.push(Completion { request: Arc::clone(request), leg, outcome });
        Ok(())
    }

    /// The first request gets `first`, every other one gets `rest`.
    pub fn add_failures<'a, I>(&mut self, requests: I, first: RequestFailure, rest: RequestFailure)
    where
        I: IntoIterator<Item = (&'a Arc<Request>, u64)>,
    {
        for (i, (request, leg)) in requests.into_iter().enumerate() {
            let failure = if i == 0 { first } else { rest };
            let _ = self.add(request, leg, CoreResponse::Error(failure));
        }
    }

    /// Deliver everything in order.
    ///
    /// A panicking sink does not stop the batch: the request whose sink
    /// panicked is failed, the rest is delivered on another task, and the
    /// panic comes back as [`NetError::CompletionPanicked`].
    pub fn deliver_all(self) -> Result<(), NetError> {
        let mut pending = self.completions.into_iter();
        while let Some(Completion { request, leg, outcome }) = pending.next() {
            let delivered = catch_unwind(AssertUnwindSafe(|| request.set_response(leg, outcome)));
            if delivered.is_err() {
                tracing::warn!(request = request.id(), "completion sink panicked");
                request.set_response(leg, CoreResponse::Error(RequestFailure::fatal(NetError::CompletionPanicked)));
                let rest = ConnectionReturnResult { completions: pending.collect() };
                if !rest.is_empty() {
                    rest.reschedule();
                }
                return Err(NetError::CompletionPanicked);
            }
        }
        Ok(())
    }

    fn reschedule(self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = self.deliver_all();
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    let _ = self.deliver_all();
                });
            }
        }
    }
}
