//! Least-recently-used list of resident lowest-level nodes.
//!
//! The list is intrusive (links live in the node header) and guarded by
//! its own lock, separate from the index mutex; the core only ever
//! updates it, the swap-out policy that consumes it lives outside this
//! crate. Only lowest-level nodes are queued: they are the unit an
//! external subsystem would push to backing storage.

use std::ptr;
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

use crate::tree::node::Node;

pub(crate) struct LruList {
    inner: Mutex<Links>,
}

struct Links {
    head: *mut Node,
    tail: *mut Node,
    len: usize,
}

unsafe impl Send for LruList {}
unsafe impl Sync for LruList {}

impl LruList {
    pub(crate) fn new() -> Self {
        LruList {
            inner: Mutex::new(Links {
                head: ptr::null_mut(),
                tail: ptr::null_mut(),
                len: 0,
            }),
        }
    }

    fn links(&self) -> std::sync::MutexGuard<'_, Links> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves `node` to the most-recently-used end, linking it first if
    /// needed.
    pub(crate) fn touch(&self, node: NonNull<Node>) {
        let mut links = self.links();
        unsafe {
            if is_linked(&links, node.as_ptr()) {
                detach(&mut links, node.as_ptr());
            }
            push_tail(&mut links, node.as_ptr());
        }
    }

    /// Unlinks `node` if present. Required before the node is freed.
    pub(crate) fn unlink(&self, node: NonNull<Node>) {
        let mut links = self.links();
        unsafe {
            if is_linked(&links, node.as_ptr()) {
                detach(&mut links, node.as_ptr());
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.links().len
    }

    /// Counts the queued nodes whose tag says lowest level. With the
    /// current queueing policy this equals `len`, but callers inspecting
    /// residency should not have to know that.
    pub(crate) fn leaf_len(&self) -> usize {
        let links = self.links();
        let mut count = 0;
        let mut cursor = links.head;
        while !cursor.is_null() {
            unsafe {
                if (*cursor).parent.is_lowest() {
                    count += 1;
                }
                cursor = (*cursor).lru_next;
            }
        }
        count
    }
}

fn is_linked(links: &Links, node: *mut Node) -> bool {
    unsafe { !(*node).lru_prev.is_null() || !(*node).lru_next.is_null() || links.head == node }
}

unsafe fn detach(links: &mut Links, node: *mut Node) {
    let prev = (*node).lru_prev;
    let next = (*node).lru_next;
    if prev.is_null() {
        links.head = next;
    } else {
        (*prev).lru_next = next;
    }
    if next.is_null() {
        links.tail = prev;
    } else {
        (*next).lru_prev = prev;
    }
    (*node).lru_prev = ptr::null_mut();
    (*node).lru_next = ptr::null_mut();
    links.len -= 1;
}

unsafe fn push_tail(links: &mut Links, node: *mut Node) {
    (*node).lru_prev = links.tail;
    (*node).lru_next = ptr::null_mut();
    if links.tail.is_null() {
        links.head = node;
    } else {
        (*links.tail).lru_next = node;
    }
    links.tail = node;
    links.len += 1;
}
