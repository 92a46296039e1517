//! # Request and Completion
//!
//! A [`Request`] is the lifecycle handle behind every non-blocking
//! operation and every blocking call built on the same machinery. Its
//! states are one-shot: `pending` transitions to exactly one of
//! `completed-ok`, `completed-error`, or `cancelled`, never back.
//!
//! Completion is published through a `parking_lot::Mutex` +
//! `parking_lot::Condvar` pair rather than an async channel: the runtime's
//! scheduling model is a pool of blocking OS threads with
//! condition-variable suspension points, and `parking_lot` is already part
//! of the dependency stack this crate pins, previously unused by its
//! async-only transports. Using it here for real gives the match engine
//! and the peer transport's completion signal a single, uniform primitive
//! instead of re-deriving one over `std::sync::Condvar`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{CommunicationError, MpiError};

/// Result of a completed receive (or send, where source/tag/count reflect
/// what was sent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub source: i32,
    pub tag: i32,
    pub count: usize,
}

/// Terminal outcome of a request.
#[derive(Debug, Clone)]
pub enum Outcome {
    Ok(Status),
    Err(MpiError_),
}

/// `MpiError` does not implement `Clone` (it wraps arbitrary `String`s and
/// `thiserror` sources), but a terminal request outcome must be observable
/// by every thread that calls `wait`/`test` on it, potentially more than
/// once. `MpiError_` is the cloneable projection stored in the completion
/// slot; `Request::into_error` renders it back into a fresh `MpiError`.
#[derive(Debug, Clone)]
pub enum MpiError_ {
    Communication(CommunicationErrorClone),
    Other(String),
}

#[derive(Debug, Clone)]
pub enum CommunicationErrorClone {
    Truncation { expected_max: usize, actual: usize },
    Timeout,
    TransportFailure(String),
}

impl From<&MpiError> for MpiError_ {
    fn from(e: &MpiError) -> Self {
        match e {
            MpiError::Communication(CommunicationError::Truncation { expected_max, actual }) => {
                MpiError_::Communication(CommunicationErrorClone::Truncation {
                    expected_max: *expected_max,
                    actual: *actual,
                })
            }
            MpiError::Communication(CommunicationError::Timeout) => {
                MpiError_::Communication(CommunicationErrorClone::Timeout)
            }
            MpiError::Communication(CommunicationError::TransportFailure(s)) => {
                MpiError_::Communication(CommunicationErrorClone::TransportFailure(s.clone()))
            }
            other => MpiError_::Other(other.to_string()),
        }
    }
}

impl From<MpiError_> for MpiError {
    fn from(e: MpiError_) -> Self {
        match e {
            MpiError_::Communication(CommunicationErrorClone::Truncation { expected_max, actual }) => {
                MpiError::Communication(CommunicationError::Truncation { expected_max, actual })
            }
            MpiError_::Communication(CommunicationErrorClone::Timeout) => {
                MpiError::Communication(CommunicationError::Timeout)
            }
            MpiError_::Communication(CommunicationErrorClone::TransportFailure(s)) => {
                MpiError::Communication(CommunicationError::TransportFailure(s))
            }
            MpiError_::Other(s) => MpiError::OperationFailed(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Pending,
    Cancelled,
}

struct Inner {
    state: Mutex<(State, Option<Outcome>)>,
    condvar: Condvar,
}

/// Non-blocking operation handle. Cloning a `Request` shares the same
/// underlying completion slot; the crate hands out a single owning clone
/// to the caller and keeps a second inside the component that will
/// complete it (the match engine for receives, the peer transport for
/// sends).
#[derive(Clone)]
pub struct Request {
    inner: Arc<Inner>,
}

impl Request {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new((State::Pending, None)),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Mark the request completed with a successful status. A request may
    /// transition into a terminal state at most once; calling this on an
    /// already-terminal request is a programming error in the caller and
    /// is ignored rather than panicking, since the component driving
    /// completion (match engine, transport) cannot always prove
    /// single-delivery statically.
    pub fn complete_ok(&self, status: Status) {
        let mut guard = self.inner.state.lock();
        if guard.1.is_none() {
            guard.1 = Some(Outcome::Ok(status));
        }
        self.inner.condvar.notify_all();
    }

    pub fn complete_err(&self, err: &MpiError) {
        let mut guard = self.inner.state.lock();
        if guard.1.is_none() {
            guard.1 = Some(Outcome::Err(MpiError_::from(err)));
        }
        self.inner.condvar.notify_all();
    }

    /// Attempt to cancel the request. Succeeds only if the request has not
    /// yet reached a terminal state; the caller is responsible for also
    /// removing any posted receive from the match engine's PRQ (this
    /// method only flips the request's own bookkeeping).
    pub fn cancel(&self) -> bool {
        let mut guard = self.inner.state.lock();
        if guard.1.is_some() {
            return false;
        }
        guard.0 = State::Cancelled;
        guard.1 = Some(Outcome::Err(MpiError_::Other("request cancelled".to_string())));
        self.inner.condvar.notify_all();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().0 == State::Cancelled
    }

    /// Block until the request reaches a terminal state and return its
    /// outcome.
    pub fn wait(&self) -> Result<Status, MpiError> {
        let mut guard = self.inner.state.lock();
        loop {
            if let Some(outcome) = &guard.1 {
                return match outcome.clone() {
                    Outcome::Ok(status) => Ok(status),
                    Outcome::Err(e) => Err(e.into()),
                };
            }
            self.inner.condvar.wait(&mut guard);
        }
    }

    /// Non-blocking poll: `Some(result)` once terminal, `None` while still
    /// pending.
    pub fn test(&self) -> Option<Result<Status, MpiError>> {
        let guard = self.inner.state.lock();
        guard.1.clone().map(|outcome| match outcome {
            Outcome::Ok(status) => Ok(status),
            Outcome::Err(e) => Err(e.into()),
        })
    }

    /// Block until terminal or until `timeout` elapses, whichever comes
    /// first. Blocking point-to-point calls wait indefinitely by default
    /// and do not use this; it exists for callers that opt into a
    /// per-call deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Status, MpiError>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.state.lock();
        loop {
            if let Some(outcome) = &guard.1 {
                return Some(match outcome.clone() {
                    Outcome::Ok(status) => Ok(status),
                    Outcome::Err(e) => Err(e.into()),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let timed_out = self.inner.condvar.wait_for(&mut guard, deadline - now);
            if timed_out.timed_out() && guard.1.is_none() {
                return None;
            }
        }
    }

    /// Stable identity of this request's completion slot, used by the
    /// match engine to find a posted receive again when cancelling it.
    pub(crate) fn arc_ptr(&self) -> *const () {
        Arc::as_ptr(&self.inner) as *const ()
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for every request in order, returning all statuses. On the first
/// error, the remaining requests are still waited on to reach a terminal
/// state before the aggregated outcome (first error reported) is
/// returned.
pub fn wait_all(requests: &[Request]) -> Result<Vec<Status>, MpiError> {
    let mut results = Vec::with_capacity(requests.len());
    let mut first_error: Option<MpiError> = None;

    for req in requests {
        match req.wait() {
            Ok(status) => results.push(status),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

/// Return the index and status of the first request observed terminal.
/// Polls round-robin with a short backoff rather than registering on every
/// request's condvar simultaneously, since requests may belong to
/// different peers with independent completion sources.
pub fn wait_any(requests: &[Request]) -> Result<(usize, Status), MpiError> {
    if requests.is_empty() {
        return Err(MpiError::OperationFailed("waitAny called with no requests".to_string()));
    }

    loop {
        for (i, req) in requests.iter().enumerate() {
            if let Some(result) = req.test() {
                return result.map(|status| (i, status));
            }
        }
        std::thread::sleep(Duration::from_micros(200));
    }
}

/// Non-blocking test across every request; returns `Some(index)` of the
/// first terminal request found, without consuming its result.
pub fn test_any(requests: &[Request]) -> Option<usize> {
    requests.iter().position(|r| r.test().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_blocks_until_completion() {
        let req = Request::new();
        let req2 = req.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            req2.complete_ok(Status { source: 0, tag: 0, count: 3 });
        });

        let status = req.wait().unwrap();
        assert_eq!(status.count, 3);
        handle.join().unwrap();
    }

    #[test]
    fn test_is_non_blocking() {
        let req = Request::new();
        assert!(req.test().is_none());
        req.complete_ok(Status { source: 1, tag: 1, count: 0 });
        assert!(req.test().unwrap().unwrap().count == 0);
    }

    #[test]
    fn terminal_transition_happens_once() {
        let req = Request::new();
        req.complete_ok(Status { source: 0, tag: 0, count: 1 });
        req.complete_err(&MpiError::OperationFailed("ignored".to_string()));
        let status = req.wait().unwrap();
        assert_eq!(status.count, 1);
    }

    #[test]
    fn cancel_before_completion_succeeds() {
        let req = Request::new();
        assert!(req.cancel());
        assert!(req.is_cancelled());
        assert!(req.wait().is_err());
    }

    #[test]
    fn cancel_after_completion_fails() {
        let req = Request::new();
        req.complete_ok(Status { source: 0, tag: 0, count: 0 });
        assert!(!req.cancel());
    }

    #[test]
    fn wait_all_reports_first_error_after_draining_rest() {
        let ok_req = Request::new();
        let err_req = Request::new();
        ok_req.complete_ok(Status { source: 0, tag: 0, count: 1 });
        err_req.complete_err(&MpiError::Connection("boom".to_string()));

        let result = wait_all(&[ok_req, err_req]);
        assert!(result.is_err());
    }

    #[test]
    fn wait_any_returns_first_terminal() {
        let a = Request::new();
        let b = Request::new();
        b.complete_ok(Status { source: 2, tag: 2, count: 5 });

        let (idx, status) = wait_any(&[a, b]).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(status.count, 5);
    }

    #[test]
    fn wait_timeout_returns_none_when_pending() {
        let req = Request::new();
        let result = req.wait_timeout(Duration::from_millis(10));
        assert!(result.is_none());
    }
}
