//! # Point-to-Point API
//!
//! `send`/`recv` and their non-blocking counterparts `isend`/`irecv`,
//! layered directly on [`crate::wire::Frame`], [`crate::transport::PeerTransport`],
//! and [`crate::matching::MatchEngine`]. Every call here validates
//! `dst`/`src`/`tag` before touching the network or the match engine, so
//! validation errors are always synchronous, as required of the runtime.

use crate::communicator::Communicator;
use crate::datatype::Datatype;
use crate::error::{MpiError, Result};
use crate::matching::{PostedReceive, ANY_SOURCE, ANY_TAG};
use crate::request::{Request, Status};
use crate::wire::Frame;

fn validate_rank(rank: i32, size: usize) -> Result<()> {
    if rank < 0 || rank as usize >= size {
        return Err(MpiError::InvalidRank { rank, size });
    }
    Ok(())
}

fn validate_send_tag(tag: i32) -> Result<()> {
    if tag < 0 {
        return Err(MpiError::InvalidTag(tag));
    }
    Ok(())
}

fn validate_recv_tag(tag: i32) -> Result<()> {
    if tag < 0 && tag != ANY_TAG {
        return Err(MpiError::InvalidTag(tag));
    }
    Ok(())
}

fn validate_recv_source(src: i32, size: usize) -> Result<()> {
    if src == ANY_SOURCE {
        return Ok(());
    }
    validate_rank(src, size)
}

impl Communicator {
    /// Blocking send: buffer is framed and handed to `dst`'s transport
    /// (or appended directly to the local unexpected queue for a
    /// self-send), returning once the bytes have been handed to the
    /// kernel.
    pub fn send(&self, buf: &[u8], count: usize, dtype: Datatype, dst: i32, tag: i32) -> Result<()> {
        self.isend(buf, count, dtype, dst, tag)?.wait().map(|_| ())
    }

    /// Blocking receive: posts a receive and waits for it to complete.
    /// `src = ANY_SOURCE` and `tag = ANY_TAG` are legal.
    pub fn recv(&self, buf: &mut [u8], cap_count: usize, dtype: Datatype, src: i32, tag: i32) -> Result<Status> {
        self.irecv(buf, cap_count, dtype, src, tag)?.wait()
    }

    /// Non-blocking send. The send request completes once the framed
    /// bytes have been handed to the transport (or, for a self-send, the
    /// instant the frame is appended to the local unexpected queue).
    pub fn isend(&self, buf: &[u8], count: usize, dtype: Datatype, dst: i32, tag: i32) -> Result<Request> {
        let size = self.size();
        validate_rank(dst, size)?;
        validate_send_tag(tag)?;

        let byte_len = count * dtype.elem_size;
        let payload = buf[..byte_len].to_vec();
        let frame = Frame::new(self.rank(), tag, payload)?;

        let request = Request::new();

        if dst == self.rank() {
            // Self-send: append directly to the local UQ, never touching
            // the network.
            self.manager.engine.deliver(frame);
            request.complete_ok(Status { source: self.rank(), tag, count });
            return Ok(request);
        }

        let transport = self.manager.peer(dst)?;
        match transport.send(&frame) {
            Ok(()) => request.complete_ok(Status { source: self.rank(), tag, count }),
            Err(e) => request.complete_err(&e),
        }
        Ok(request)
    }

    /// Non-blocking receive. The returned request completes once the
    /// match engine delivers a matching frame into `buf`; until then the
    /// caller must not read `buf`.
    pub fn irecv(&self, buf: &mut [u8], cap_count: usize, dtype: Datatype, src: i32, tag: i32) -> Result<Request> {
        let size = self.size();
        validate_recv_source(src, size)?;
        validate_recv_tag(tag)?;

        let request = Request::new();
        let cap_bytes = cap_count * dtype.elem_size;
        let posted = PostedReceive::new(src, tag, &mut buf[..cap_bytes], dtype.elem_size, request.clone());
        self.manager.engine.post(posted);
        Ok(request)
    }

    /// Inspect the unexpected queue for a frame matching `(src, tag)`
    /// without removing it.
    pub fn iprobe(&self, src: i32, tag: i32) -> Option<Status> {
        self.manager.engine.probe(src, tag)
    }

    /// Blocking probe: spin until a matching frame is observed in the
    /// unexpected queue. Busy-waits with a short sleep, since probing
    /// does not itself own a completion condvar the way a posted receive
    /// does.
    pub fn probe(&self, src: i32, tag: i32) -> Status {
        loop {
            if let Some(status) = self.iprobe(src, tag) {
                return status;
            }
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_process_world() -> Communicator {
        std::env::remove_var("MPI_SIZE");
        std::env::remove_var("MPI_RANK");
        std::env::remove_var("MPI_PORT_BASE");
        let manager = std::sync::Arc::new(crate::process::ProcessManager::initialize().unwrap());
        Communicator::world(manager)
    }

    #[test]
    fn self_send_recv_round_trips_without_network() {
        let comm = single_process_world();
        let payload = 42i32.to_le_bytes();
        comm.send(&payload, 1, Datatype::INT32, 0, 7).unwrap();

        let mut buf = [0u8; 4];
        let status = comm.recv(&mut buf, 1, Datatype::INT32, 0, 7).unwrap();
        assert_eq!(status, Status { source: 0, tag: 7, count: 1 });
        assert_eq!(i32::from_le_bytes(buf), 42);
    }

    #[test]
    fn recv_any_source_any_tag_reports_actual_values() {
        let comm = single_process_world();
        comm.send(&1i32.to_le_bytes(), 1, Datatype::INT32, 0, 3).unwrap();

        let mut buf = [0u8; 4];
        let status = comm.recv(&mut buf, 1, Datatype::INT32, ANY_SOURCE, ANY_TAG).unwrap();
        assert_eq!(status.source, 0);
        assert_eq!(status.tag, 3);
    }

    #[test]
    fn send_to_invalid_rank_is_rejected_synchronously() {
        let comm = single_process_world();
        let err = comm.send(&[0u8; 4], 1, Datatype::INT32, 5, 0).unwrap_err();
        assert!(matches!(err, MpiError::InvalidRank { .. }));
    }

    #[test]
    fn negative_send_tag_is_rejected() {
        let comm = single_process_world();
        let err = comm.send(&[0u8; 4], 1, Datatype::INT32, 0, -5).unwrap_err();
        assert!(matches!(err, MpiError::InvalidTag(-5)));
    }

    #[test]
    fn zero_length_payload_round_trips_with_zero_count() {
        let comm = single_process_world();
        comm.send(&[], 0, Datatype::INT32, 0, 1).unwrap();
        let mut buf: [u8; 0] = [];
        let status = comm.recv(&mut buf, 0, Datatype::INT32, 0, 1).unwrap();
        assert_eq!(status.count, 0);
    }

    #[test]
    fn truncated_receive_buffer_fails_with_communication_error() {
        let comm = single_process_world();
        comm.send(&4u32.to_le_bytes(), 1, Datatype::UINT32, 0, 1).unwrap();
        let mut buf = [0u8; 2];
        let err = comm.recv(&mut buf, 2, Datatype::UINT8, 0, 1).unwrap_err();
        assert!(matches!(err, MpiError::Communication(_)));
    }
}
