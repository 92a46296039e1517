//! # Match Engine
//!
//! The heart of the substrate. A single mutex protects two
//! FIFO queues per local rank:
//!
//! - **UQ** (unexpected queue): frames that arrived before a matching
//!   receive was posted, in arrival order.
//! - **PRQ** (posted-receive queue): receives with no matching frame yet,
//!   in post order.
//!
//! `deliver` (driven by the peer transport's receive loop) and `post`
//! (driven by `p2p.rs`) are the only two entry points, and both run under
//! the same lock so a frame and a receive can never each believe the other
//! is still waiting.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::{CommunicationError, MpiError};
use crate::request::{Request, Status};
use crate::wire::Frame;

/// Wildcard sentinel for a receive's expected source.
pub const ANY_SOURCE: i32 = -1;
/// Wildcard sentinel for a receive's expected tag.
pub const ANY_TAG: i32 = -1;

/// A receive posted into the PRQ: everything the match engine needs to
/// complete it once a matching frame arrives, without reaching back into
/// `p2p.rs`.
pub struct PostedReceive {
    pub want_source: i32,
    pub want_tag: i32,
    /// Destination buffer. Boxed as a raw pointer + length pair rather
    /// than a borrowed slice so `PostedReceive` can outlive the calling
    /// stack frame for non-blocking `irecv`; safety is upheld by the
    /// buffer-lifetime contract for non-blocking operations: the caller
    /// must not touch the buffer until the paired request completes.
    dest: *mut u8,
    capacity: usize,
    pub elem_size: usize,
    pub request: Request,
}

// SAFETY: `PostedReceive` is only ever constructed from a `&mut [u8]` that
// the caller guarantees stays alive and unaliased until `request`
// completes (the buffer-lifetime contract above). The match engine itself
// never reads the pointee except to memcpy into it while holding the
// engine lock, and never hands the pointer to another thread without this
// same guarantee.
unsafe impl Send for PostedReceive {}

impl PostedReceive {
    /// # Safety
    /// `dest` must remain valid for `capacity` bytes until `request`
    /// reaches a terminal state.
    pub fn new(want_source: i32, want_tag: i32, dest: &mut [u8], elem_size: usize, request: Request) -> Self {
        Self {
            want_source,
            want_tag,
            dest: dest.as_mut_ptr(),
            capacity: dest.len(),
            elem_size,
            request,
        }
    }

    fn matches(&self, frame: &Frame) -> bool {
        (self.want_source == ANY_SOURCE || self.want_source == frame.source)
            && (self.want_tag == ANY_TAG || self.want_tag == frame.tag)
    }

    /// Copy `frame`'s payload into the destination buffer and complete the
    /// associated request. Must only be called while holding the match
    /// engine's lock, with `frame` already verified to fit.
    fn fulfil(&self, frame: &Frame) {
        let len = frame.payload.len().min(self.capacity);
        // SAFETY: see the struct-level safety comment; the buffer is live
        // and exclusively owned by this in-flight receive.
        unsafe {
            std::ptr::copy_nonoverlapping(frame.payload.as_ptr(), self.dest, len);
        }
        self.request.complete_ok(Status {
            source: frame.source,
            tag: frame.tag,
            count: frame.payload.len() / self.elem_size.max(1),
        });
    }

    fn fail_truncated(&self, frame_len: usize) {
        self.request.complete_err(&MpiError::Communication(CommunicationError::Truncation {
            expected_max: self.capacity,
            actual: frame_len,
        }));
    }
}

struct State {
    uq: VecDeque<Frame>,
    prq: VecDeque<PostedReceive>,
}

/// Per-rank matching engine: one instance lives inside the process
/// manager and is shared by every peer transport's receive loop and by
/// every call to `recv`/`irecv`/`probe`.
pub struct MatchEngine {
    state: Mutex<State>,
}

impl Default for MatchEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                uq: VecDeque::new(),
                prq: VecDeque::new(),
            }),
        }
    }

    /// Arrival path: a frame just arrived (from the network, or via local
    /// loopback for self-sends). Scan PRQ in FIFO order for the first
    /// match; if none, append to UQ.
    pub fn deliver(&self, frame: Frame) {
        let mut state = self.state.lock();

        let slot = state.prq.iter().position(|r| r.matches(&frame));
        match slot {
            Some(idx) => {
                let receive = state.prq.remove(idx).unwrap();
                if frame.payload.len() > receive.capacity {
                    receive.fail_truncated(frame.payload.len());
                } else {
                    receive.fulfil(&frame);
                }
            }
            None => {
                state.uq.push_back(frame);
            }
        }
    }

    /// Post path: register a receive. If a matching frame is already
    /// sitting in UQ, complete immediately; otherwise append to PRQ and
    /// let a later `deliver` complete it.
    pub fn post(&self, receive: PostedReceive) {
        let mut state = self.state.lock();

        let slot = state.uq.iter().position(|f| receive.matches(f));
        match slot {
            Some(idx) => {
                let frame = state.uq.remove(idx).unwrap();
                if frame.payload.len() > receive.capacity {
                    receive.fail_truncated(frame.payload.len());
                } else {
                    receive.fulfil(&frame);
                }
            }
            None => {
                state.prq.push_back(receive);
            }
        }
    }

    /// Remove a still-pending receive from PRQ, identified by its
    /// request. Returns `true` if found and removed (i.e. cancellation
    /// succeeded); `false` if it was already matched (the caller must
    /// still wait on the request).
    pub fn cancel_posted(&self, request: &Request) -> bool {
        let mut state = self.state.lock();
        if let Some(idx) = state.prq.iter().position(|r| same_request(&r.request, request)) {
            state.prq.remove(idx);
            true
        } else {
            false
        }
    }

    /// Inspect UQ for a frame matching `(want_source, want_tag)` without
    /// removing it.
    pub fn probe(&self, want_source: i32, want_tag: i32) -> Option<Status> {
        let state = self.state.lock();
        state
            .uq
            .iter()
            .find(|f| {
                (want_source == ANY_SOURCE || want_source == f.source)
                    && (want_tag == ANY_TAG || want_tag == f.tag)
            })
            .map(|f| Status {
                source: f.source,
                tag: f.tag,
                count: f.payload.len(),
            })
    }

    /// Drain PRQ, completing every still-pending receive with a
    /// communication error. Used by `finalize()` to surface failures on
    /// any request that can no longer be satisfied, once every peer is
    /// being torn down anyway.
    pub fn fail_all_pending(&self, reason: &str) {
        let mut state = self.state.lock();
        for receive in state.prq.drain(..) {
            receive.request.complete_err(&MpiError::Communication(CommunicationError::TransportFailure(
                reason.to_string(),
            )));
        }
        state.uq.clear();
    }

    /// A single peer's connection dropped. Only fail PRQ entries that
    /// could only ever have been satisfied by that peer
    /// (`want_source == peer_rank`), plus wildcard `ANY_SOURCE` entries
    /// when `no_peers_remain` says no other peer could still satisfy them.
    /// Only drop that peer's own frames from UQ; unrelated traffic is left
    /// untouched.
    pub fn fail_peer(&self, peer_rank: i32, reason: &str, no_peers_remain: bool) {
        let mut state = self.state.lock();

        let mut idx = 0;
        while idx < state.prq.len() {
            let affected = state.prq[idx].want_source == peer_rank || (no_peers_remain && state.prq[idx].want_source == ANY_SOURCE);
            if affected {
                let receive = state.prq.remove(idx).unwrap();
                receive.request.complete_err(&MpiError::Communication(CommunicationError::TransportFailure(
                    reason.to_string(),
                )));
            } else {
                idx += 1;
            }
        }

        state.uq.retain(|frame| frame.source != peer_rank);
    }

    pub fn uq_len(&self) -> usize {
        self.state.lock().uq.len()
    }

    pub fn prq_len(&self) -> usize {
        self.state.lock().prq.len()
    }
}

fn same_request(a: &Request, b: &Request) -> bool {
    a.arc_ptr() == b.arc_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(src: i32, tag: i32, payload: Vec<u8>) -> Frame {
        Frame::new(src, tag, payload).unwrap()
    }

    #[test]
    fn deliver_then_post_matches_immediately_in_post() {
        let engine = MatchEngine::new();
        engine.deliver(frame(1, 5, vec![1, 2, 3, 4]));

        let mut buf = [0u8; 8];
        let req = Request::new();
        engine.post(PostedReceive::new(1, 5, &mut buf, 4, req.clone()));

        let status = req.wait().unwrap();
        assert_eq!(status, Status { source: 1, tag: 5, count: 1 });
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn post_then_deliver_matches_on_arrival() {
        let engine = MatchEngine::new();
        let mut buf = [0u8; 4];
        let req = Request::new();
        engine.post(PostedReceive::new(0, 9, &mut buf, 1, req.clone()));
        assert_eq!(engine.prq_len(), 1);

        engine.deliver(frame(0, 9, vec![7, 7, 7, 7]));
        assert_eq!(engine.prq_len(), 0);

        let status = req.wait().unwrap();
        assert_eq!(status.count, 4);
        assert_eq!(buf, [7, 7, 7, 7]);
    }

    #[test]
    fn wildcard_source_and_tag_match_anything() {
        let engine = MatchEngine::new();
        let mut buf = [0u8; 4];
        let req = Request::new();
        engine.post(PostedReceive::new(ANY_SOURCE, ANY_TAG, &mut buf, 1, req.clone()));

        engine.deliver(frame(3, 42, vec![9, 9, 9, 9]));

        let status = req.wait().unwrap();
        assert_eq!(status.source, 3);
        assert_eq!(status.tag, 42);
    }

    #[test]
    fn prq_scanned_in_fifo_order() {
        let engine = MatchEngine::new();
        let mut buf_a = [0u8; 4];
        let mut buf_b = [0u8; 4];
        let req_a = Request::new();
        let req_b = Request::new();
        // Both receives are wildcard so only FIFO post order decides which
        // one a single arriving frame satisfies.
        engine.post(PostedReceive::new(ANY_SOURCE, ANY_TAG, &mut buf_a, 1, req_a.clone()));
        engine.post(PostedReceive::new(ANY_SOURCE, ANY_TAG, &mut buf_b, 1, req_b.clone()));

        engine.deliver(frame(0, 0, vec![1, 1, 1, 1]));

        assert!(req_a.test().is_some());
        assert!(req_b.test().is_none());
    }

    #[test]
    fn truncation_fails_the_receive() {
        let engine = MatchEngine::new();
        let mut buf = [0u8; 2];
        let req = Request::new();
        engine.post(PostedReceive::new(0, 0, &mut buf, 1, req.clone()));

        engine.deliver(frame(0, 0, vec![1, 2, 3, 4]));

        let err = req.wait().unwrap_err();
        assert!(matches!(err, MpiError::Communication(CommunicationError::Truncation { .. })));
    }

    #[test]
    fn unrelated_tags_do_not_match() {
        let engine = MatchEngine::new();
        engine.deliver(frame(0, 1, vec![1]));

        let mut buf = [0u8; 1];
        let req = Request::new();
        engine.post(PostedReceive::new(0, 2, &mut buf, 1, req.clone()));

        assert!(req.test().is_none());
        assert_eq!(engine.uq_len(), 1);
        assert_eq!(engine.prq_len(), 1);
    }

    #[test]
    fn cancel_posted_removes_from_prq() {
        let engine = MatchEngine::new();
        let mut buf = [0u8; 1];
        let req = Request::new();
        engine.post(PostedReceive::new(0, 0, &mut buf, 1, req.clone()));

        assert!(engine.cancel_posted(&req));
        assert_eq!(engine.prq_len(), 0);
    }

    #[test]
    fn cancel_posted_fails_once_matched() {
        let engine = MatchEngine::new();
        let mut buf = [0u8; 1];
        let req = Request::new();
        engine.post(PostedReceive::new(0, 0, &mut buf, 1, req.clone()));
        engine.deliver(frame(0, 0, vec![5]));

        assert!(!engine.cancel_posted(&req));
    }

    #[test]
    fn probe_does_not_remove_frame() {
        let engine = MatchEngine::new();
        engine.deliver(frame(1, 1, vec![1, 2, 3]));

        let status = engine.probe(ANY_SOURCE, ANY_TAG).unwrap();
        assert_eq!(status.source, 1);
        assert_eq!(engine.uq_len(), 1);
    }

    #[test]
    fn fail_all_pending_completes_prq_with_errors() {
        let engine = MatchEngine::new();
        let mut buf = [0u8; 1];
        let req = Request::new();
        engine.post(PostedReceive::new(0, 0, &mut buf, 1, req.clone()));

        engine.fail_all_pending("transport failed");
        assert!(req.wait().is_err());
    }

    #[test]
    fn fail_peer_only_fails_receives_posted_for_that_source() {
        let engine = MatchEngine::new();
        let mut buf_a = [0u8; 1];
        let mut buf_b = [0u8; 1];
        let req_a = Request::new();
        let req_b = Request::new();
        engine.post(PostedReceive::new(1, ANY_TAG, &mut buf_a, 1, req_a.clone()));
        engine.post(PostedReceive::new(2, ANY_TAG, &mut buf_b, 1, req_b.clone()));

        engine.fail_peer(1, "connection to rank 1 closed", false);

        assert!(req_a.wait().is_err());
        assert!(req_b.test().is_none());
        assert_eq!(engine.prq_len(), 1);
    }

    #[test]
    fn fail_peer_leaves_any_source_receive_pending_while_other_peers_remain() {
        let engine = MatchEngine::new();
        let mut buf = [0u8; 1];
        let req = Request::new();
        engine.post(PostedReceive::new(ANY_SOURCE, ANY_TAG, &mut buf, 1, req.clone()));

        engine.fail_peer(1, "connection to rank 1 closed", false);

        assert!(req.test().is_none());
        assert_eq!(engine.prq_len(), 1);
    }

    #[test]
    fn fail_peer_fails_any_source_receive_once_no_peers_remain() {
        let engine = MatchEngine::new();
        let mut buf = [0u8; 1];
        let req = Request::new();
        engine.post(PostedReceive::new(ANY_SOURCE, ANY_TAG, &mut buf, 1, req.clone()));

        engine.fail_peer(1, "connection to rank 1 closed", true);

        assert!(req.wait().is_err());
    }

    #[test]
    fn fail_peer_drops_only_that_peers_unexpected_frames() {
        let engine = MatchEngine::new();
        engine.deliver(frame(1, 0, vec![1]));
        engine.deliver(frame(2, 0, vec![2]));

        engine.fail_peer(1, "connection to rank 1 closed", false);

        assert_eq!(engine.uq_len(), 1);
        let status = engine.probe(ANY_SOURCE, ANY_TAG).unwrap();
        assert_eq!(status.source, 2);
    }

    #[test]
    fn zero_length_payload_matches_and_counts_zero() {
        let engine = MatchEngine::new();
        let mut buf: [u8; 0] = [];
        let req = Request::new();
        engine.post(PostedReceive::new(0, 0, &mut buf, 4, req.clone()));

        engine.deliver(frame(0, 0, vec![]));

        let status = req.wait().unwrap();
        assert_eq!(status.count, 0);
    }
}
