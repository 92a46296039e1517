//! # Communicator
//!
//! A communicator is a handle over the process-wide [`ProcessManager`]
//! plus a private tag-space offset, so a duplicated communicator's
//! collectives cannot collide with its parent's in-flight messages.
//! Freeing a communicator only drops the handle; the manager and its
//! transports live until `finalize()`.

use std::sync::Arc;

use crate::process::ProcessManager;

/// A group of ranks `{0..size}` with this process's rank within it.
#[derive(Clone)]
pub struct Communicator {
    pub(crate) manager: Arc<ProcessManager>,
    pub(crate) tag_offset: u32,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("tag_offset", &self.tag_offset)
            .finish()
    }
}

impl Communicator {
    pub(crate) fn world(manager: Arc<ProcessManager>) -> Self {
        Self { manager, tag_offset: 0 }
    }

    pub fn size(&self) -> usize {
        self.manager.size()
    }

    pub fn rank(&self) -> i32 {
        self.manager.rank()
    }

    /// Create a new communicator over the same group with a fresh
    /// tag-space offset, so its collectives never collide with `self`'s
    /// in-flight reserved-tag traffic.
    pub fn duplicate(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            tag_offset: self.manager.allocate_tag_offset(),
        }
    }

    /// Release this handle. Never tears down the underlying process
    /// manager or its transports — only `finalize()` does that.
    pub fn free(self) {}

    /// Map a reserved collective base tag (e.g. `BARRIER_TAG`) into this
    /// communicator's private tag space.
    pub(crate) fn reserved_tag(&self, base: i32) -> i32 {
        base + self.tag_offset as i32
    }
}
