// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tree traversal visitors.
//!
//! [`TreeVisitor`] is the depth-first protocol used by everything that
//! walks a test tree: capability searches, the per-unit tree cloner, the
//! ancestor finder used for error-policy dispatch, and the test compiler in
//! [`crate::worker`].

use super::{HashTree, NodeArena, NodeId, TestTree};
use crate::elements::Caps;
use indexmap::IndexMap;

/// Depth-first traversal callbacks.
pub trait TreeVisitor {
    /// Called when descending into `id`, whose children are `subtree`.
    fn add_node(&mut self, id: NodeId, subtree: &HashTree, arena: &mut NodeArena);

    /// Called when ascending out of the most recently added node.
    fn subtract_node(&mut self, _arena: &mut NodeArena) {}

    /// Called when a leaf has been reached.
    fn process_path(&mut self, _arena: &mut NodeArena) {}
}

/// Collects every node whose capability set intersects the searched one,
/// together with the subtree rooted at each match.
pub struct SearchByCaps {
    caps: Caps,
    found: Vec<NodeId>,
    subtrees: IndexMap<NodeId, HashTree>,
}

impl SearchByCaps {
    /// Creates a search for nodes carrying any capability in `caps`.
    pub fn new(caps: Caps) -> Self {
        Self {
            caps,
            found: Vec::new(),
            subtrees: IndexMap::new(),
        }
    }

    /// The matched node ids, in traversal order.
    pub fn results(&self) -> &[NodeId] {
        &self.found
    }

    /// Number of matches.
    pub fn count(&self) -> usize {
        self.found.len()
    }

    /// The tree rooted at a matched node (the match is the root key).
    pub fn subtree(&self, id: NodeId) -> Option<&HashTree> {
        self.subtrees.get(&id)
    }
}

impl TreeVisitor for SearchByCaps {
    fn add_node(&mut self, id: NodeId, subtree: &HashTree, arena: &mut NodeArena) {
        if arena.caps(id).intersects(self.caps) {
            self.found.push(id);
            let mut rooted = HashTree::new();
            rooted.put(id, subtree.clone());
            self.subtrees.insert(id, rooted);
        }
    }
}

/// Builds a parallel tree in a fresh arena, cloning every element except
/// (optionally) those marked `NO_THREAD_CLONE`, which are passed through by
/// shared reference.
pub struct TreeCloner {
    skip_no_clone: bool,
    new_tree: TestTree,
    path: Vec<NodeId>,
}

impl TreeCloner {
    /// Creates a cloner. With `skip_no_clone` set, shared elements are
    /// referenced instead of cloned.
    pub fn new(skip_no_clone: bool) -> Self {
        Self {
            skip_no_clone,
            new_tree: TestTree::new(),
            path: Vec::new(),
        }
    }

    /// Consumes the cloner, returning the cloned tree.
    pub fn into_tree(self) -> TestTree {
        self.new_tree
    }
}

impl TreeVisitor for TreeCloner {
    fn add_node(&mut self, id: NodeId, _subtree: &HashTree, arena: &mut NodeArena) {
        let new_id = match arena.shared_handle(id) {
            Some(handle) if self.skip_no_clone => self.new_tree.insert_shared(&self.path, handle),
            _ => {
                let cloned = arena.with(id, |el| el.boxed_clone());
                self.new_tree.insert(&self.path, cloned)
            }
        };
        self.path.push(new_id);
    }

    fn subtract_node(&mut self, _arena: &mut NodeArena) {
        self.path.pop();
    }
}

/// Records the ancestors of a target node. Once the target has been
/// reached, recording stops, leaving the root-to-target path on the stack.
pub struct FindAncestors {
    target: NodeId,
    stack: Vec<NodeId>,
    stop_recording: bool,
}

impl FindAncestors {
    /// Creates a finder for the path from the root down to `target`.
    pub fn new(target: NodeId) -> Self {
        Self {
            target,
            stack: Vec::new(),
            stop_recording: false,
        }
    }

    /// The ancestor controllers of the target, nearest first.
    pub fn controllers_to_root(&self, arena: &NodeArena) -> Vec<NodeId> {
        self.stack
            .iter()
            .rev()
            .copied()
            .filter(|id| *id != self.target && arena.caps(*id).contains(Caps::CONTROLLER))
            .collect()
    }
}

impl TreeVisitor for FindAncestors {
    fn add_node(&mut self, id: NodeId, _subtree: &HashTree, _arena: &mut NodeArena) {
        if self.stop_recording {
            return;
        }
        if id == self.target {
            self.stop_recording = true;
        }
        self.stack.push(id);
    }

    fn subtract_node(&mut self, _arena: &mut NodeArena) {
        if self.stop_recording {
            return;
        }
        self.stack.pop();
    }
}

/// Renders a tree as an indented outline of element names.
pub struct ConvertToString {
    out: String,
    depth: usize,
}

impl ConvertToString {
    /// Creates an empty renderer.
    pub fn new() -> Self {
        Self {
            out: String::from("{"),
            depth: 0,
        }
    }

    /// The rendered outline.
    pub fn into_string(mut self) -> String {
        self.out.push_str("\n}");
        self.out
    }
}

impl Default for ConvertToString {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeVisitor for ConvertToString {
    fn add_node(&mut self, id: NodeId, _subtree: &HashTree, arena: &mut NodeArena) {
        self.depth += 1;
        self.out.push('\n');
        self.out.push_str(&"  ".repeat(self.depth));
        self.out.push_str(arena.name(id).as_str());
        self.out.push_str(" {");
    }

    fn subtract_node(&mut self, _arena: &mut NodeArena) {
        self.out.push('\n');
        self.out.push_str(&"  ".repeat(self.depth));
        self.out.push('}');
        self.depth -= 1;
    }
}
