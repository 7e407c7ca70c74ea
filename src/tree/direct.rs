//! Sibling discovery for direct access: given a lowest-level node, find
//! the lowest-level node that immediately follows it in key order.
//!
//! The algorithm climbs from the leaf through the `parent_offset`
//! back-indices until it reaches the first ancestor with room to the
//! right of the climbed path, then descends along slot 0. Each climb
//! step is O(1), so the whole discovery is O(levels); without the
//! back-index every step would have to scan the parent's slot array.

use std::ptr::NonNull;

use log::trace;

use super::node::Node;
use super::Tree;
use crate::error::Error;

impl Tree {
    /// Read-only discovery. `Absent` when the sibling subtree is missing
    /// a node anywhere along the descent, or when `leaf` is the last
    /// lowest-level position of the whole key space.
    pub(crate) fn find_next_sibling(&mut self, leaf: NonNull<Node>) -> Result<NonNull<Node>, Error> {
        self.next_sibling(leaf, false)
    }

    /// Discovery that materializes the sibling path: mid nodes at every
    /// intermediate step, a lowest node at the last.
    pub(crate) fn create_next_sibling(
        &mut self,
        leaf: NonNull<Node>,
    ) -> Result<NonNull<Node>, Error> {
        self.next_sibling(leaf, true)
    }

    fn next_sibling(&mut self, leaf: NonNull<Node>, create: bool) -> Result<NonNull<Node>, Error> {
        unsafe {
            Node::assert_magic(leaf);
            assert!(Node::is_lowest(leaf), "sibling discovery starts at a lowest-level node");
        }

        // Nothing to the right anywhere up the path means the leaf covers
        // the end of the key space; there is no sibling to find or create.
        let Some((ancestor, branch_offset, ancestor_level)) = self.climb_to_capable_ancestor(leaf)
        else {
            return Err(Error::Absent);
        };
        trace!(
            "descending from {:p}[{}] at level {}",
            ancestor,
            branch_offset,
            ancestor_level
        );

        let mut current = ancestor;
        let mut offset = branch_offset;
        for level in ancestor_level + 1..=self.levels.lowest_level() {
            let slot = unsafe { Node::slot(current, offset) };
            current = match slot.as_child() {
                Some(child) => child,
                None if create => self.create_node(current, offset, level)?,
                None => return Err(Error::Absent),
            };
            offset = 0;
        }

        debug_assert_ne!(current, leaf, "sibling discovery went nowhere");
        debug_assert!(unsafe { Node::is_lowest(current) });
        Ok(current)
    }

    /// Climb phase: the first ancestor whose slot array has room to the
    /// right of the path climbed so far. Returns the ancestor, the slot
    /// offset where the sibling subtree roots, and the ancestor's level;
    /// `None` when the climb exits through the root.
    fn climb_to_capable_ancestor(
        &self,
        leaf: NonNull<Node>,
    ) -> Option<(NonNull<Node>, usize, usize)> {
        let mut current = leaf;
        let mut level = self.levels.lowest_level();
        loop {
            let parent = unsafe { Node::parent(current) }?;
            let offset = unsafe { Node::parent_offset(current) };
            debug_assert_eq!(
                unsafe { Node::slot(parent, offset).as_child() },
                Some(current),
                "parent table does not reference the climbed child"
            );
            level -= 1;
            if offset + 1 < unsafe { Node::slot_count(parent) } {
                return Some((parent, offset + 1, level));
            }
            current = parent;
        }
    }
}
