//! The tree core: walk, create-path, slot operations, pruning and
//! post-order destruction. Everything here runs under the index mutex;
//! the public wrappers live in `index`.

pub(crate) mod node;
pub(crate) mod pool;

mod direct;

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use log::{debug, trace};

use crate::backend::Backend;
use crate::error::Error;
use crate::levels::LevelMap;
use crate::lru::LruList;
use node::{Node, ParentLink, Slot, ValueRef};
use pool::NodePool;

#[cfg(not(target_pointer_width = "64"))]
compile_error!("compilation is only possible for 64-bit targets");

pub(crate) struct Tree {
    levels: LevelMap,
    root: NonNull<Node>,
    root_layout: Layout,
    low_pool: NodePool,
    mid_pool: NodePool,
    lru: Arc<LruList>,
    backend: Arc<dyn Backend>,
    total_bytes: usize,
    values: usize,
}

unsafe impl Send for Tree {}

impl Tree {
    pub(crate) fn new(
        levels: LevelMap,
        lru: Arc<LruList>,
        backend: Arc<dyn Backend>,
    ) -> Result<Self, Error> {
        let low_pool = NodePool::new("low", levels.lowest().size)?;
        // With no mid levels the pool never allocates; size it like the
        // lowest one so the layout stays valid.
        let mid_size = levels.mid().map_or(levels.lowest().size, |d| d.size);
        let mid_pool = NodePool::new("mid", mid_size)?;

        let root_layout = Node::layout(levels.root().size)?;
        let raw = unsafe { alloc_zeroed(root_layout) };
        let root = NonNull::new(raw.cast::<Node>()).ok_or(Error::OutOfMemory)?;
        unsafe {
            Node::init(root, ParentLink::root(), 0, levels.root().size as u32);
        }
        debug!("index geometry: {:?}", levels);

        Ok(Tree {
            levels,
            root,
            root_layout,
            low_pool,
            mid_pool,
            lru,
            backend,
            total_bytes: 0,
            values: 0,
        })
    }

    pub(crate) fn levels(&self) -> &LevelMap {
        &self.levels
    }

    pub(crate) fn leaf_nodes(&self) -> usize {
        self.low_pool.live()
    }

    pub(crate) fn mid_nodes(&self) -> usize {
        self.mid_pool.live()
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub(crate) fn values(&self) -> usize {
        self.values
    }

    pub(crate) fn node_bytes(&self) -> (usize, usize) {
        (self.low_pool.obj_bytes(), self.mid_pool.obj_bytes())
    }

    pub(crate) fn lowest_slice(&self, key: u64) -> usize {
        self.levels.slice(key, self.levels.lowest_level())
    }

    fn check_key(&self, key: u64) {
        let bits = self.levels.key_bits();
        if bits < 64 {
            debug_assert_eq!(key >> bits, 0, "key 0x{key:x} exceeds the indexed {bits} bits");
        }
    }

    /// Slot count of a lowest-level node handed back to a caller;
    /// validates the handle on the way.
    pub(crate) fn leaf_size(&self, leaf: NonNull<Node>) -> usize {
        unsafe {
            Node::assert_magic(leaf);
            assert!(Node::is_lowest(leaf), "direct access requires a lowest-level handle");
            Node::slot_count(leaf)
        }
    }

    /// Pure descent. Returns the lowest-level node covering `key`, or
    /// `Absent` at the first null slot. Never mutates.
    pub(crate) fn walk(&self, key: u64) -> Result<NonNull<Node>, Error> {
        self.check_key(key);
        let mut current = self.root;
        for level in 0..self.levels.depth() - 1 {
            let offset = self.levels.slice(key, level);
            let slot = unsafe { Node::slot(current, offset) };
            match slot.as_child() {
                Some(child) => current = child,
                None => return Err(Error::Absent),
            }
        }
        debug_assert!(unsafe { Node::is_lowest(current) });
        Ok(current)
    }

    /// Descent that materializes every missing node along `key`,
    /// returning the lowest-level node. Nodes created before a failed
    /// allocation stay attached; they are empty and harmless.
    pub(crate) fn create_path(&mut self, key: u64) -> Result<NonNull<Node>, Error> {
        self.check_key(key);
        let mut current = self.root;
        for level in 0..self.levels.depth() - 1 {
            let offset = self.levels.slice(key, level);
            let slot = unsafe { Node::slot(current, offset) };
            current = match slot.as_child() {
                Some(child) => child,
                None => self.create_node(current, offset, level + 1)?,
            };
        }
        debug_assert!(unsafe { Node::is_lowest(current) });
        Ok(current)
    }

    /// Allocates a node for `level`, attaches it at `parent[offset]` and
    /// bumps the parent's refcount.
    pub(crate) fn create_node(
        &mut self,
        parent: NonNull<Node>,
        offset: usize,
        level: usize,
    ) -> Result<NonNull<Node>, Error> {
        let lowest = level == self.levels.lowest_level();
        let pool = if lowest {
            &mut self.low_pool
        } else {
            &mut self.mid_pool
        };
        let node = pool.alloc()?;
        let bytes = pool.obj_bytes();
        let slot_count = pool.slot_count() as u32;
        unsafe {
            debug_assert!(Node::slot(parent, offset).is_empty());
            Node::init(node, ParentLink::child_of(parent, lowest), offset as u32, slot_count);
            Node::set_slot(parent, offset, Slot::child(node));
            Node::inc_ref(parent);
        }
        self.total_bytes += bytes;
        self.backend.on_entry_alloc(bytes, self.total_bytes);
        if lowest {
            self.lru.touch(node);
        }
        trace!(
            "created {} node {:p} at {:p}[{}]",
            if lowest { "lowest" } else { "mid" },
            node,
            parent,
            offset
        );
        Ok(node)
    }

    /// Unlinks a node from the auxiliary structures and returns it to its
    /// pool. The parent slot must already be cleared.
    fn free_node(&mut self, node: NonNull<Node>) {
        debug_assert!(
            !unsafe { (*node.as_ptr()).parent.is_locked() },
            "freeing a node locked for swap"
        );
        let lowest = unsafe { Node::is_lowest(node) };
        if lowest {
            self.lru.unlink(node);
        }
        let pool = if lowest {
            &mut self.low_pool
        } else {
            &mut self.mid_pool
        };
        let bytes = pool.obj_bytes();
        pool.dealloc(node);
        self.total_bytes -= bytes;
        self.backend.on_entry_free(bytes, self.total_bytes);
    }

    /// Places `value` into `leaf[offset]`. An occupied slot is
    /// overwritten only with `replace`, without a refcount change.
    pub(crate) fn insert_at(
        &mut self,
        leaf: NonNull<Node>,
        offset: usize,
        value: ValueRef,
        replace: bool,
    ) -> Result<(), Error> {
        unsafe {
            Node::assert_magic(leaf);
            assert!(Node::is_lowest(leaf));
            assert!(offset < Node::slot_count(leaf));
            let slot = Node::slot(leaf, offset);
            if slot.is_empty() {
                Node::set_slot(leaf, offset, Slot::value(value));
                Node::inc_ref(leaf);
                self.values += 1;
            } else if replace {
                Node::set_slot(leaf, offset, Slot::value(value));
            } else {
                return Err(Error::Exists);
            }
        }
        self.lru.touch(leaf);
        Ok(())
    }

    /// Reads `leaf[offset]`; a null slot is `Absent`.
    pub(crate) fn value_at(&self, leaf: NonNull<Node>, offset: usize) -> Result<ValueRef, Error> {
        unsafe {
            Node::assert_magic(leaf);
            assert!(Node::is_lowest(leaf));
            assert!(offset < Node::slot_count(leaf));
            let value = Node::slot(leaf, offset).as_value().ok_or(Error::Absent)?;
            self.lru.touch(leaf);
            Ok(value)
        }
    }

    /// Clears `leaf[offset]` and prunes upward. `Absent` when the slot is
    /// already empty, with no state change.
    pub(crate) fn remove_at(&mut self, leaf: NonNull<Node>, offset: usize) -> Result<(), Error> {
        unsafe {
            Node::assert_magic(leaf);
            assert!(Node::is_lowest(leaf));
            assert!(offset < Node::slot_count(leaf));
            if Node::slot(leaf, offset).is_empty() {
                return Err(Error::Absent);
            }
            Node::set_slot(leaf, offset, Slot::EMPTY);
            Node::dec_ref(leaf);
        }
        self.values -= 1;
        self.prune(leaf);
        Ok(())
    }

    /// Walks upward from `start`, freeing every node whose refcount
    /// reached zero and detaching it from its parent. Stops at the first
    /// ancestor still referenced, or at the root, which is never freed.
    fn prune(&mut self, start: NonNull<Node>) {
        let mut current = start;
        loop {
            unsafe {
                if Node::ref_cnt(current) != 0 {
                    break;
                }
                let Some(parent) = Node::parent(current) else {
                    break;
                };
                let offset = Node::parent_offset(current);
                debug_assert_eq!(Node::slot(parent, offset).as_child(), Some(current));
                Node::set_slot(parent, offset, Slot::EMPTY);
                Node::dec_ref(parent);
                trace!("pruned node {:p} from {:p}[{}]", current, parent, offset);
                self.free_node(current);
                current = parent;
            }
        }
    }

    unsafe fn destroy_subtree(&mut self, node: NonNull<Node>) {
        if Node::is_lowest(node) {
            self.destroy_lowest(node);
        } else {
            self.destroy_mid(node);
        }
    }

    /// Drops the node's value references; the values themselves belong to
    /// the caller.
    unsafe fn destroy_lowest(&mut self, node: NonNull<Node>) {
        for offset in 0..Node::slot_count(node) {
            if !Node::slot(node, offset).is_empty() {
                Node::set_slot(node, offset, Slot::EMPTY);
                Node::dec_ref(node);
                self.values -= 1;
            }
        }
        debug_assert_eq!(Node::ref_cnt(node), 0);
        self.free_node(node);
    }

    unsafe fn destroy_mid(&mut self, node: NonNull<Node>) {
        for offset in 0..Node::slot_count(node) {
            if let Some(child) = Node::slot(node, offset).as_child() {
                self.destroy_subtree(child);
                Node::set_slot(node, offset, Slot::EMPTY);
                Node::dec_ref(node);
            }
        }
        debug_assert_eq!(Node::ref_cnt(node), 0);
        self.free_node(node);
    }

    /// Full consistency sweep: refcounts, back-links, level tags. Panics
    /// on the first violation; meant for tests and debugging sessions.
    pub(crate) fn check_invariants(&self) {
        unsafe {
            self.check_node(self.root, 0);
        }
    }

    unsafe fn check_node(&self, node: NonNull<Node>, level: usize) {
        Node::assert_magic(node);
        let lowest_level = self.levels.lowest_level();
        assert_eq!(
            Node::is_root(node),
            level == 0,
            "root tag disagrees with tree depth at {:p}",
            node
        );
        assert_eq!(
            Node::is_lowest(node),
            level == lowest_level,
            "level tag disagrees with tree depth at {:p}",
            node
        );
        assert_eq!(Node::slot_count(node), self.levels.desc(level).size);

        let mut occupied = 0u32;
        for offset in 0..Node::slot_count(node) {
            let slot = Node::slot(node, offset);
            if slot.is_empty() {
                continue;
            }
            occupied += 1;
            if level < lowest_level {
                let child = slot.as_child().unwrap();
                assert_eq!(
                    Node::parent(child),
                    Some(node),
                    "child {:p} does not point back at {:p}",
                    child,
                    node
                );
                assert_eq!(Node::parent_offset(child), offset);
                self.check_node(child, level + 1);
            }
        }
        assert_eq!(
            Node::ref_cnt(node),
            occupied,
            "refcount of {:p} disagrees with its occupied slots",
            node
        );
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        unsafe {
            for offset in 0..Node::slot_count(self.root) {
                if let Some(child) = Node::slot(self.root, offset).as_child() {
                    self.destroy_subtree(child);
                    Node::set_slot(self.root, offset, Slot::EMPTY);
                    Node::dec_ref(self.root);
                }
            }
            debug_assert_eq!(Node::ref_cnt(self.root), 0);
            dealloc(self.root.as_ptr().cast(), self.root_layout);
        }
    }
}
