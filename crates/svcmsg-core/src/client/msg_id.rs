//! Message id allocation for one connection.

use crate::message::MsgId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Strictly increasing message ids.
///
/// Zero is never handed out, and ids still in use (awaiting a reply, or
/// abandoned after a timeout and not yet answered) are skipped after the
/// counter wraps.
#[derive(Debug)]
pub struct MsgIdGenerator {
    next: AtomicU64,
}

impl Default for MsgIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: MsgId) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Next id for which `in_use` is false.
    pub fn next_id(&self, in_use: impl Fn(MsgId) -> bool) -> MsgId {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !in_use(id) {
                return id;
            }
        }
    }
}
