//! Fixed-size node allocators, one per node geometry.
//!
//! Every lowest-level node is identically sized and so is every mid-level
//! node, so each pool hands out objects of a single layout and keeps a
//! free list for churn-heavy workloads. Objects come back zeroed: a fresh
//! allocation uses `alloc_zeroed`, a recycled one is scrubbed before
//! reuse.

use std::alloc::{alloc_zeroed, dealloc};
use std::ptr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace};

use super::node::Node;
use crate::error::Error;

/// Process-wide sequence so coexisting indexes get distinct pool names.
static POOL_SEQ: AtomicU64 = AtomicU64::new(0);

pub(crate) struct NodePool {
    name: String,
    layout: std::alloc::Layout,
    slot_count: usize,
    free: Vec<NonNull<Node>>,
    live: usize,
}

unsafe impl Send for NodePool {}

impl NodePool {
    pub(crate) fn new(kind: &str, slot_count: usize) -> Result<Self, Error> {
        let layout = Node::layout(slot_count)?;
        let name = format!("radex-{}-{}", kind, POOL_SEQ.fetch_add(1, Ordering::Relaxed));
        debug!(
            "pool {}: {} slots, {} bytes per node",
            name,
            slot_count,
            layout.size()
        );
        Ok(NodePool {
            name,
            layout,
            slot_count,
            free: Vec::new(),
            live: 0,
        })
    }

    /// Bytes of one pooled object, header included.
    pub(crate) fn obj_bytes(&self) -> usize {
        self.layout.size()
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Objects currently handed out to the tree.
    pub(crate) fn live(&self) -> usize {
        self.live
    }

    /// Returns a zeroed node, recycling the free list before touching the
    /// global allocator.
    pub(crate) fn alloc(&mut self) -> Result<NonNull<Node>, Error> {
        let node = match self.free.pop() {
            Some(node) => {
                unsafe {
                    ptr::write_bytes(node.as_ptr().cast::<u8>(), 0, self.layout.size());
                }
                node
            }
            None => {
                let raw = unsafe { alloc_zeroed(self.layout) };
                NonNull::new(raw.cast()).ok_or(Error::OutOfMemory)?
            }
        };
        self.live += 1;
        trace!("pool {}: alloc {:p} ({} live)", self.name, node, self.live);
        Ok(node)
    }

    /// Takes a node back. The memory is kept for reuse; only the magic is
    /// scrubbed so stale handles fail their checks.
    pub(crate) fn dealloc(&mut self, node: NonNull<Node>) {
        debug_assert!(self.live > 0, "pool {} freed more than it allocated", self.name);
        unsafe {
            Node::scrub_magic(node);
        }
        self.live -= 1;
        self.free.push(node);
        trace!("pool {}: free {:p} ({} live)", self.name, node, self.live);
    }
}

impl Drop for NodePool {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.live, 0,
            "pool {} torn down with live nodes",
            self.name
        );
        debug!("pool {}: dropping {} cached nodes", self.name, self.free.len());
        for node in self.free.drain(..) {
            unsafe { dealloc(node.as_ptr().cast(), self.layout) };
        }
    }
}
