//! # Collective Algorithms
//!
//! Every collective here is built strictly out of point-to-point
//! primitives (`Communicator::send`/`recv`/`isend`/`irecv`) plus a
//! reserved tag range private to the communicator, so collectives can
//! never collide with application traffic or with each other across
//! communicators (each `duplicate()` gets its own offset into the
//! range). On a size-1 communicator every collective degenerates to a
//! local no-op or copy, per the boundary behavior every implementation
//! here honors explicitly rather than relying on the general N-rank path
//! happening to work for N=1.

use crate::communicator::Communicator;
use crate::datatype::{Datatype, Operation};
use crate::error::{MpiError, Result};
use crate::request::wait_all;

const BARRIER_TAG: i32 = 9999;
const BCAST_TAG: i32 = 1000;
const REDUCE_TAG: i32 = 2000;
const GATHER_TAG: i32 = 3000;
const SCATTER_TAG: i32 = 4000;
const ALLTOALL_TAG_BASE: i32 = 5000;
const SCAN_TAG: i32 = 6000;

impl Communicator {
    /// Returns only after every rank in the communicator has entered.
    /// Two-phase: every non-root sends to root, then waits for root's
    /// acknowledgement; root receives from every non-root, then
    /// broadcasts the release.
    pub fn barrier(&self) -> Result<()> {
        let size = self.size();
        if size == 1 {
            return Ok(());
        }
        let tag = self.reserved_tag(BARRIER_TAG);
        let root = 0;

        if self.rank() == root {
            for peer in 1..size as i32 {
                let mut buf = [0u8; 1];
                self.recv(&mut buf, 1, Datatype::BYTE, peer, tag)?;
            }
            for peer in 1..size as i32 {
                self.send(&[0u8], 1, Datatype::BYTE, peer, tag)?;
            }
        } else {
            self.send(&[0u8], 1, Datatype::BYTE, root, tag)?;
            let mut buf = [0u8; 1];
            self.recv(&mut buf, 1, Datatype::BYTE, root, tag)?;
        }
        Ok(())
    }

    /// Broadcasts `buf` from `root` to every other rank. `root` calls
    /// with its source data already in `buf`; non-roots call with a
    /// buffer of the same size that is overwritten.
    pub fn bcast(&self, buf: &mut [u8], count: usize, dtype: Datatype, root: i32) -> Result<()> {
        if self.size() == 1 {
            return Ok(());
        }
        let tag = self.reserved_tag(BCAST_TAG);

        if self.rank() == root {
            let mut requests = Vec::new();
            for peer in 0..self.size() as i32 {
                if peer == root {
                    continue;
                }
                requests.push(self.isend(buf, count, dtype, peer, tag)?);
            }
            wait_all(&requests)?;
            Ok(())
        } else {
            self.recv(buf, count, dtype, root, tag).map(|_| ())
        }
    }

    /// Folds every rank's `sendbuf` into `recvbuf` on `root` using `op`.
    /// `recvbuf` is meaningful only on `root`; non-roots may pass an
    /// empty slice.
    pub fn reduce(
        &self,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
        count: usize,
        dtype: Datatype,
        op: Operation,
        root: i32,
    ) -> Result<()> {
        let byte_len = count * dtype.elem_size;
        if self.size() == 1 {
            recvbuf[..byte_len].copy_from_slice(&sendbuf[..byte_len]);
            return Ok(());
        }
        let tag = self.reserved_tag(REDUCE_TAG);

        if self.rank() == root {
            recvbuf[..byte_len].copy_from_slice(&sendbuf[..byte_len]);
            let mut incoming = vec![0u8; byte_len];
            for peer in 0..self.size() as i32 {
                if peer == root {
                    continue;
                }
                self.recv(&mut incoming, count, dtype, peer, tag)?;
                crate::datatype::reduce_into(&mut recvbuf[..byte_len], &incoming, dtype, op)?;
            }
            Ok(())
        } else {
            self.send(sendbuf, count, dtype, root, tag)
        }
    }

    /// `reduce(root=0)` followed by `bcast(root=0)`: every rank ends up
    /// with the folded result in `recvbuf`.
    pub fn allreduce(&self, sendbuf: &[u8], recvbuf: &mut [u8], count: usize, dtype: Datatype, op: Operation) -> Result<()> {
        self.reduce(sendbuf, recvbuf, count, dtype, op, 0)?;
        self.bcast(recvbuf, count, dtype, 0)
    }

    /// Each rank contributes `sendcount` elements; `root` places rank
    /// `r`'s chunk at byte offset `r * sendcount * elem_size` of
    /// `recvbuf`, including its own chunk via a local copy.
    pub fn gather(&self, sendbuf: &[u8], recvbuf: &mut [u8], sendcount: usize, dtype: Datatype, root: i32) -> Result<()> {
        let chunk = sendcount * dtype.elem_size;
        if self.size() == 1 {
            recvbuf[..chunk].copy_from_slice(&sendbuf[..chunk]);
            return Ok(());
        }
        let tag = self.reserved_tag(GATHER_TAG);

        if self.rank() == root {
            let own_offset = root as usize * chunk;
            recvbuf[own_offset..own_offset + chunk].copy_from_slice(&sendbuf[..chunk]);
            for peer in 0..self.size() as i32 {
                if peer == root {
                    continue;
                }
                let offset = peer as usize * chunk;
                self.recv(&mut recvbuf[offset..offset + chunk], sendcount, dtype, peer, tag)?;
            }
            Ok(())
        } else {
            self.send(sendbuf, sendcount, dtype, root, tag)
        }
    }

    /// Inverse of `gather`: `root` sends slice `i` of `sendbuf` to rank
    /// `i`, local-copying its own slice.
    pub fn scatter(&self, sendbuf: &[u8], recvbuf: &mut [u8], recvcount: usize, dtype: Datatype, root: i32) -> Result<()> {
        let chunk = recvcount * dtype.elem_size;
        if self.size() == 1 {
            recvbuf[..chunk].copy_from_slice(&sendbuf[..chunk]);
            return Ok(());
        }
        let tag = self.reserved_tag(SCATTER_TAG);

        if self.rank() == root {
            let own_offset = root as usize * chunk;
            recvbuf[..chunk].copy_from_slice(&sendbuf[own_offset..own_offset + chunk]);
            let mut requests = Vec::new();
            for peer in 0..self.size() as i32 {
                if peer == root {
                    continue;
                }
                let offset = peer as usize * chunk;
                requests.push(self.isend(&sendbuf[offset..offset + chunk], recvcount, dtype, peer, tag)?);
            }
            wait_all(&requests)?;
            Ok(())
        } else {
            self.recv(recvbuf, recvcount, dtype, root, tag).map(|_| ())
        }
    }

    /// `gather(root=0)` followed by `bcast(root=0)` of the full buffer.
    pub fn allgather(&self, sendbuf: &[u8], recvbuf: &mut [u8], sendcount: usize, dtype: Datatype) -> Result<()> {
        self.gather(sendbuf, recvbuf, sendcount, dtype, 0)?;
        let total = self.size() * sendcount * dtype.elem_size;
        self.bcast(&mut recvbuf[..total], self.size() * sendcount, dtype, 0)
    }

    /// Rank `r` sends slice `i` of `sendbuf` to rank `i` and receives
    /// slice `r` of every other rank's buffer into the corresponding
    /// slot of `recvbuf`; the local slice is a memcpy. Uses non-blocking
    /// sends paired with blocking receives so symmetric traffic between
    /// every pair cannot deadlock.
    pub fn alltoall(&self, sendbuf: &[u8], recvbuf: &mut [u8], count: usize, dtype: Datatype) -> Result<()> {
        let chunk = count * dtype.elem_size;
        let rank = self.rank();
        let size = self.size();

        if size == 1 {
            recvbuf[..chunk].copy_from_slice(&sendbuf[..chunk]);
            return Ok(());
        }

        let own_offset = rank as usize * chunk;
        recvbuf[own_offset..own_offset + chunk].copy_from_slice(&sendbuf[own_offset..own_offset + chunk]);

        let mut requests = Vec::new();
        for peer in 0..size as i32 {
            if peer == rank {
                continue;
            }
            let tag = self.reserved_tag(ALLTOALL_TAG_BASE + rank);
            let offset = peer as usize * chunk;
            requests.push(self.isend(&sendbuf[offset..offset + chunk], count, dtype, peer, tag)?);
        }

        for peer in 0..size as i32 {
            if peer == rank {
                continue;
            }
            let tag = self.reserved_tag(ALLTOALL_TAG_BASE + peer);
            let offset = peer as usize * chunk;
            self.recv(&mut recvbuf[offset..offset + chunk], count, dtype, peer, tag)?;
        }

        wait_all(&requests)?;
        Ok(())
    }

    /// Inclusive prefix reduction: rank `r`'s result folds ranks
    /// `0..=r`. Implemented as a ring: rank 0 seeds the running partial
    /// with its own value; each subsequent rank folds the partial it
    /// receives with its local value, stores the fold as its result, and
    /// forwards it onward.
    pub fn scan(&self, sendbuf: &[u8], recvbuf: &mut [u8], count: usize, dtype: Datatype, op: Operation) -> Result<()> {
        let byte_len = count * dtype.elem_size;
        let rank = self.rank();
        if self.size() == 1 {
            recvbuf[..byte_len].copy_from_slice(&sendbuf[..byte_len]);
            return Ok(());
        }
        let tag = self.reserved_tag(SCAN_TAG);

        if rank == 0 {
            recvbuf[..byte_len].copy_from_slice(&sendbuf[..byte_len]);
        } else {
            self.recv(&mut recvbuf[..byte_len], count, dtype, rank - 1, tag)?;
            crate::datatype::reduce_into(&mut recvbuf[..byte_len], &sendbuf[..byte_len], dtype, op)?;
        }

        if (rank as usize) + 1 < self.size() {
            self.send(&recvbuf[..byte_len], count, dtype, rank + 1, tag)?;
        }
        Ok(())
    }

    /// Exclusive prefix reduction: rank `r`'s result folds ranks
    /// `0..r`; rank 0's result is the identity element of `op` under
    /// `dtype`.
    pub fn exscan(&self, sendbuf: &[u8], recvbuf: &mut [u8], count: usize, dtype: Datatype, op: Operation) -> Result<()> {
        let byte_len = count * dtype.elem_size;
        let rank = self.rank();
        if self.size() == 1 {
            identity_into(recvbuf, dtype, op)?;
            return Ok(());
        }
        let tag = self.reserved_tag(SCAN_TAG);

        let inclusive = if rank == 0 {
            identity_into(&mut recvbuf[..byte_len], dtype, op)?;
            sendbuf[..byte_len].to_vec()
        } else {
            let mut partial = vec![0u8; byte_len];
            self.recv(&mut partial, count, dtype, rank - 1, tag)?;
            recvbuf[..byte_len].copy_from_slice(&partial);
            let mut folded = partial;
            crate::datatype::reduce_into(&mut folded, &sendbuf[..byte_len], dtype, op)?;
            folded
        };

        if (rank as usize) + 1 < self.size() {
            self.send(&inclusive, count, dtype, rank + 1, tag)?;
        }
        Ok(())
    }
}

/// Identity element of `op` under `dtype`, written into `out`. Only the
/// (op, dtype) combinations `reduce_into` itself supports are covered;
/// anything else is `invalid-datatype`, matching `reduce_into`'s own
/// rejection policy.
fn identity_into(out: &mut [u8], dtype: Datatype, op: Operation) -> Result<()> {
    use crate::datatype::DatatypeKind::*;

    macro_rules! write_identity {
        ($ty:ty, $value:expr) => {{
            let bytes = (<$ty>::from($value)).to_le_bytes();
            if out.len() % bytes.len() != 0 {
                return Err(MpiError::OperationFailed("identity buffer length mismatch".to_string()));
            }
            for chunk in out.chunks_mut(bytes.len()) {
                chunk.copy_from_slice(&bytes);
            }
            return Ok(());
        }};
    }

    match (dtype.kind, op) {
        (Int32, Operation::Sum) | (Int32, Operation::BitwiseOr) | (Int32, Operation::BitwiseXor) => write_identity!(i32, 0),
        (Int32, Operation::Product) => write_identity!(i32, 1),
        (Int32, Operation::BitwiseAnd) => write_identity!(i32, -1),
        (Int32, Operation::Max) => write_identity!(i32, i32::MIN),
        (Int32, Operation::Min) => write_identity!(i32, i32::MAX),
        (Int64, Operation::Sum) | (Int64, Operation::BitwiseOr) | (Int64, Operation::BitwiseXor) => write_identity!(i64, 0),
        (Int64, Operation::Product) => write_identity!(i64, 1),
        (Int64, Operation::BitwiseAnd) => write_identity!(i64, -1),
        (Int64, Operation::Max) => write_identity!(i64, i64::MIN),
        (Int64, Operation::Min) => write_identity!(i64, i64::MAX),
        (Uint32, Operation::Sum) | (Uint32, Operation::BitwiseOr) | (Uint32, Operation::BitwiseXor) => write_identity!(u32, 0u32),
        (Uint32, Operation::Product) => write_identity!(u32, 1u32),
        (Uint32, Operation::BitwiseAnd) => write_identity!(u32, u32::MAX),
        (Uint32, Operation::Max) => write_identity!(u32, u32::MIN),
        (Uint32, Operation::Min) => write_identity!(u32, u32::MAX),
        (Float32, Operation::Sum) => write_identity!(f32, 0.0f32),
        (Float32, Operation::Product) => write_identity!(f32, 1.0f32),
        (Float64, Operation::Sum) => write_identity!(f64, 0.0f64),
        (Float64, Operation::Product) => write_identity!(f64, 1.0f64),
        (Bool, Operation::LogicalAnd) => {
            out.fill(1);
            Ok(())
        }
        (Bool, Operation::LogicalOr) | (Bool, Operation::LogicalXor) => {
            out.fill(0);
            Ok(())
        }
        (Int32Int, _) | (Int64Int, _) | (Float32Int, _) | (Float64Int, _) => loc_identity_into(out, dtype, op),
        _ => Err(MpiError::InvalidDatatype { op: op_name(op), datatype: dtype.name() }),
    }
}

/// Identity element for `MinLoc`/`MaxLoc` over a `(value, index)` pair: the
/// value side is the datatype's extreme in the unhelpful direction, the
/// index side is `-1` (no rank can ever hold index `-1`, so it's always
/// beaten by a real contribution).
fn loc_identity_into(out: &mut [u8], dtype: Datatype, op: Operation) -> Result<()> {
    use crate::datatype::DatatypeKind::*;

    macro_rules! write_loc_identity {
        ($ty:ty, $value:expr) => {{
            let val_bytes = (<$ty>::from($value)).to_le_bytes();
            let idx_bytes = (-1i32).to_le_bytes();
            let elem = val_bytes.len() + idx_bytes.len();
            if out.len() % elem != 0 {
                return Err(MpiError::OperationFailed("identity buffer length mismatch".to_string()));
            }
            for chunk in out.chunks_mut(elem) {
                chunk[..val_bytes.len()].copy_from_slice(&val_bytes);
                chunk[val_bytes.len()..].copy_from_slice(&idx_bytes);
            }
            return Ok(());
        }};
    }

    match (dtype.kind, op) {
        (Int32Int, Operation::MinLoc) => write_loc_identity!(i32, i32::MAX),
        (Int32Int, Operation::MaxLoc) => write_loc_identity!(i32, i32::MIN),
        (Int64Int, Operation::MinLoc) => write_loc_identity!(i64, i64::MAX),
        (Int64Int, Operation::MaxLoc) => write_loc_identity!(i64, i64::MIN),
        (Float32Int, Operation::MinLoc) => write_loc_identity!(f32, f32::INFINITY),
        (Float32Int, Operation::MaxLoc) => write_loc_identity!(f32, f32::NEG_INFINITY),
        (Float64Int, Operation::MinLoc) => write_loc_identity!(f64, f64::INFINITY),
        (Float64Int, Operation::MaxLoc) => write_loc_identity!(f64, f64::NEG_INFINITY),
        _ => Err(MpiError::InvalidDatatype { op: op_name(op), datatype: dtype.name() }),
    }
}

fn op_name(op: Operation) -> &'static str {
    match op {
        Operation::Max => "max",
        Operation::Min => "min",
        Operation::Sum => "sum",
        Operation::Product => "product",
        Operation::LogicalAnd => "logical_and",
        Operation::LogicalOr => "logical_or",
        Operation::LogicalXor => "logical_xor",
        Operation::BitwiseAnd => "bitwise_and",
        Operation::BitwiseOr => "bitwise_or",
        Operation::BitwiseXor => "bitwise_xor",
        Operation::MinLoc => "minloc",
        Operation::MaxLoc => "maxloc",
    }
}
