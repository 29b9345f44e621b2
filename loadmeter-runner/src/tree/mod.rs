// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test tree: an arena of elements plus an ordered hash tree of node
//! ids.
//!
//! Elements are stored once in a [`NodeArena`] and addressed by [`NodeId`].
//! The [`HashTree`] holds only structure (an ordered map from node id to
//! child tree), so cloning a subtree's shape is cheap and visitors can walk
//! structure while mutating elements. Elements that must be shared across
//! execution units (`NO_THREAD_CLONE`) live in `Arc<Mutex<…>>` slots; all
//! other slots are owned boxes, giving each unit lock-free access to its
//! cloned tree.

mod traverse;

pub use traverse::{ConvertToString, FindAncestors, SearchByCaps, TreeCloner, TreeVisitor};

use crate::elements::{Caps, TestElement};
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// A shared, internally synchronized element slot.
pub type SharedElement = Arc<Mutex<Box<dyn TestElement>>>;

/// Locks a mutex, recovering from poisoning.
///
/// Listener and element state stays usable even if another unit panicked
/// while holding the lock.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identifier of a node within a [`NodeArena`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// A fabricated id for unit tests that do not need a real arena.
    #[cfg(test)]
    pub(crate) fn test(index: u32) -> Self {
        Self(index)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug)]
enum NodeSlot {
    Owned(Box<dyn TestElement>),
    Shared(SharedElement),
    /// The node is temporarily taken out for a `&mut` operation.
    Vacant,
}

/// Storage for the elements of a test tree.
#[derive(Debug, Default)]
pub struct NodeArena {
    slots: Vec<NodeSlot>,
}

impl NodeArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes ever inserted.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if the arena holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Inserts an element, wrapping it in a shared slot when it declares
    /// `NO_THREAD_CLONE`.
    pub fn insert(&mut self, mut element: Box<dyn TestElement>) -> NodeId {
        let id = NodeId(self.slots.len() as u32);
        element.core_mut().set_node_id(id);
        let slot = if element.caps().contains(Caps::NO_THREAD_CLONE) {
            NodeSlot::Shared(Arc::new(Mutex::new(element)))
        } else {
            NodeSlot::Owned(element)
        };
        self.slots.push(slot);
        id
    }

    /// Inserts an already shared element, e.g. when cloning a tree whose
    /// `NO_THREAD_CLONE` nodes are passed through by reference.
    pub fn insert_shared(&mut self, element: SharedElement) -> NodeId {
        let id = NodeId(self.slots.len() as u32);
        self.slots.push(NodeSlot::Shared(element));
        id
    }

    /// Returns the shared handle of a node, if it is a shared slot.
    pub fn shared_handle(&self, id: NodeId) -> Option<SharedElement> {
        match &self.slots[id.index()] {
            NodeSlot::Shared(handle) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    /// Runs `f` with a shared reference to the node.
    pub fn with<R>(&self, id: NodeId, f: impl FnOnce(&dyn TestElement) -> R) -> R {
        match &self.slots[id.index()] {
            NodeSlot::Owned(el) => f(el.as_ref()),
            NodeSlot::Shared(handle) => f(lock(handle).as_ref()),
            NodeSlot::Vacant => panic!("node {id} is taken; cannot borrow"),
        }
    }

    /// Runs `f` with an exclusive reference to the node.
    pub fn with_mut<R>(&mut self, id: NodeId, f: impl FnOnce(&mut dyn TestElement) -> R) -> R {
        match &mut self.slots[id.index()] {
            NodeSlot::Owned(el) => f(el.as_mut()),
            NodeSlot::Shared(handle) => f(lock(handle).as_mut()),
            NodeSlot::Vacant => panic!("node {id} is taken; cannot borrow"),
        }
    }

    /// The node's capability set.
    pub fn caps(&self, id: NodeId) -> Caps {
        self.with(id, |el| el.caps())
    }

    /// The node's element name.
    pub fn name(&self, id: NodeId) -> SmolStr {
        self.with(id, |el| el.name())
    }

    /// The node's scope level, if assigned.
    pub fn level(&self, id: NodeId) -> Option<u8> {
        self.with(id, |el| el.core().level())
    }

    /// Assigns the node's scope level if it does not have one yet.
    pub fn assign_level(&mut self, id: NodeId, level: u8) {
        self.with_mut(id, |el| {
            if el.core().level().is_none() {
                el.core_mut().set_level(level);
            }
        });
    }

    /// Removes an owned node from its slot. Panics for shared or already
    /// taken slots; samplers and controllers are never shared.
    pub(crate) fn take(&mut self, id: NodeId) -> Box<dyn TestElement> {
        match std::mem::replace(&mut self.slots[id.index()], NodeSlot::Vacant) {
            NodeSlot::Owned(el) => el,
            slot @ NodeSlot::Shared(_) => {
                self.slots[id.index()] = slot;
                panic!("node {id} is shared; shared elements cannot be taken")
            }
            NodeSlot::Vacant => panic!("node {id} is already taken"),
        }
    }

    pub(crate) fn restore(&mut self, id: NodeId, element: Box<dyn TestElement>) {
        debug_assert!(matches!(self.slots[id.index()], NodeSlot::Vacant));
        self.slots[id.index()] = NodeSlot::Owned(element);
    }
}

/// An ordered mapping from a node to the tree of its children.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HashTree {
    children: IndexMap<NodeId, HashTree>,
}

impl HashTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the tree has no keys.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of direct keys.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Puts `subtree` under `id`, replacing and returning any previous
    /// subtree.
    pub fn put(&mut self, id: NodeId, subtree: HashTree) -> Option<HashTree> {
        self.children.insert(id, subtree)
    }

    /// Adds `id` as a key with an empty subtree (or returns the existing
    /// one).
    pub fn add_key(&mut self, id: NodeId) -> &mut HashTree {
        self.children.entry(id).or_default()
    }

    /// Returns the subtree under `id`.
    pub fn get(&self, id: NodeId) -> Option<&HashTree> {
        self.children.get(&id)
    }

    /// Returns the subtree under `id`, mutably.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut HashTree> {
        self.children.get_mut(&id)
    }

    /// The ordered list of direct keys.
    pub fn list(&self) -> Vec<NodeId> {
        self.children.keys().copied().collect()
    }

    /// Navigates `path` from the root, creating intermediate keys as
    /// needed, and adds `id` at the end.
    pub fn add_key_by_treepath(&mut self, path: &[NodeId], id: NodeId) {
        let mut tree = self;
        for step in path {
            tree = tree.add_key(*step);
        }
        tree.add_key(id);
    }

    /// The ordered keys of the subtree identified by `path`, or empty when
    /// the path does not exist.
    pub fn list_by_treepath(&self, path: &[NodeId]) -> Vec<NodeId> {
        self.subtree_by_treepath(path)
            .map(HashTree::list)
            .unwrap_or_default()
    }

    /// The subtree identified by `path`.
    pub fn subtree_by_treepath(&self, path: &[NodeId]) -> Option<&HashTree> {
        let mut tree = self;
        for step in path {
            tree = tree.get(*step)?;
        }
        Some(tree)
    }

    /// Depth-first traversal: `add_node` on descent, `process_path` at
    /// leaves, `subtract_node` on ascent.
    pub fn traverse(&self, arena: &mut NodeArena, visitor: &mut dyn TreeVisitor) {
        for (id, subtree) in &self.children {
            visitor.add_node(*id, subtree, arena);
            if subtree.is_empty() {
                visitor.process_path(arena);
            } else {
                subtree.traverse(arena, visitor);
            }
            visitor.subtract_node(arena);
        }
    }
}

/// A [`NodeArena`] coupled with the [`HashTree`] describing its structure.
#[derive(Debug, Default)]
pub struct TestTree {
    arena: NodeArena,
    tree: HashTree,
}

impl TestTree {
    /// Creates an empty test tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an element under the node path `path` (empty for a root
    /// node) and returns its id.
    pub fn insert(&mut self, path: &[NodeId], element: Box<dyn TestElement>) -> NodeId {
        let id = self.arena.insert(element);
        self.tree.add_key_by_treepath(path, id);
        id
    }

    /// Inserts a shared element under `path`.
    pub fn insert_shared(&mut self, path: &[NodeId], element: SharedElement) -> NodeId {
        let id = self.arena.insert_shared(element);
        self.tree.add_key_by_treepath(path, id);
        id
    }

    /// The ordered root node ids.
    pub fn roots(&self) -> Vec<NodeId> {
        self.tree.list()
    }

    /// The structural tree.
    pub fn structure(&self) -> &HashTree {
        &self.tree
    }

    /// The element arena.
    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    /// The element arena, mutably.
    pub fn arena_mut(&mut self) -> &mut NodeArena {
        &mut self.arena
    }

    /// The node's capability set.
    pub fn caps(&self, id: NodeId) -> Caps {
        self.arena.caps(id)
    }

    /// The node's element name.
    pub fn name(&self, id: NodeId) -> SmolStr {
        self.arena.name(id)
    }

    /// Runs `f` with a shared reference to the node.
    pub fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&dyn TestElement) -> R) -> R {
        self.arena.with(id, f)
    }

    /// Runs `f` with an exclusive reference to the node.
    pub fn with_node_mut<R>(&mut self, id: NodeId, f: impl FnOnce(&mut dyn TestElement) -> R) -> R {
        self.arena.with_mut(id, f)
    }

    /// Takes the node out of the arena for the duration of `f`, so that `f`
    /// can operate on the node and the rest of the tree at the same time.
    /// This is how controllers recurse into their children.
    pub fn with_taken<R>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut dyn TestElement, &mut TestTree) -> R,
    ) -> R {
        if let Some(shared) = self.arena.shared_handle(id) {
            let mut guard = lock(&shared);
            return f(guard.as_mut(), self);
        }
        let mut element = self.arena.take(id);
        let result = f(element.as_mut(), self);
        self.arena.restore(id, element);
        result
    }

    /// Traverses the whole tree with `visitor`.
    pub fn traverse(&mut self, visitor: &mut dyn TreeVisitor) {
        self.tree.traverse(&mut self.arena, visitor);
    }

    /// Renders the tree structure with element names, for logs and tests.
    pub fn render(&mut self) -> String {
        let mut conv = ConvertToString::new();
        self.traverse(&mut conv);
        conv.into_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        controls::{Controller, LoopController},
        elements::builtin::{DebugSampler, ResultCollector},
    };
    use pretty_assertions::assert_eq;

    fn sampler(name: &str) -> Box<dyn TestElement> {
        Box::new(DebugSampler::new(name))
    }

    #[test]
    fn list_by_treepath_returns_subtree_keys_in_order() {
        let mut tree = TestTree::new();
        let root = tree.insert(&[], Box::new(LoopController::new("root", 1)));
        let a = tree.insert(&[root], sampler("a"));
        let b = tree.insert(&[root], sampler("b"));
        let c = tree.insert(&[root, a], sampler("c"));

        assert_eq!(tree.roots(), vec![root]);
        assert_eq!(tree.structure().list_by_treepath(&[root]), vec![a, b]);
        assert_eq!(tree.structure().list_by_treepath(&[root, a]), vec![c]);
        assert!(tree.structure().list_by_treepath(&[a]).is_empty());
    }

    #[test]
    fn traversal_is_depth_first_with_leaf_markers() {
        struct Recorder(Vec<String>);
        impl TreeVisitor for Recorder {
            fn add_node(&mut self, id: NodeId, _subtree: &HashTree, arena: &mut NodeArena) {
                self.0.push(format!("+{}", arena.name(id)));
            }
            fn subtract_node(&mut self, _arena: &mut NodeArena) {
                self.0.push("-".to_string());
            }
            fn process_path(&mut self, _arena: &mut NodeArena) {
                self.0.push("*".to_string());
            }
        }

        let mut tree = TestTree::new();
        let root = tree.insert(&[], Box::new(LoopController::new("root", 1)));
        let a = tree.insert(&[root], sampler("a"));
        tree.insert(&[root, a], sampler("c"));
        tree.insert(&[root], sampler("b"));

        let mut recorder = Recorder(Vec::new());
        tree.traverse(&mut recorder);
        assert_eq!(
            recorder.0,
            vec!["+root", "+a", "+c", "*", "-", "-", "+b", "*", "-", "-"]
        );
    }

    #[test]
    fn cloner_copies_elements_and_shares_no_clone_nodes() {
        let mut tree = TestTree::new();
        let root = tree.insert(&[], Box::new(LoopController::new("root", 1)));
        let s = tree.insert(&[root], sampler("s"));
        let shared = tree.insert(&[root], Box::new(ResultCollector::new("rc")));

        let mut cloner = TreeCloner::new(true);
        tree.traverse(&mut cloner);
        let cloned = cloner.into_tree();

        // Same shape and names, different element instances.
        let cloned_root = cloned.roots()[0];
        let children = cloned.structure().list_by_treepath(&[cloned_root]);
        assert_eq!(children.len(), 2);
        assert_eq!(cloned.name(children[0]), "s");
        tree.with_node_mut(s, |el| el.set_name("renamed"));
        assert_eq!(cloned.name(children[0]), "s");

        // The collector is passed through by reference.
        let original_handle = tree.arena().shared_handle(shared).unwrap();
        let cloned_handle = cloned.arena().shared_handle(children[1]).unwrap();
        assert!(Arc::ptr_eq(&original_handle, &cloned_handle));
    }

    #[test]
    fn find_ancestors_lists_controllers_nearest_first() {
        let mut tree = TestTree::new();
        let outer = tree.insert(&[], Box::new(LoopController::new("outer", 1)));
        let inner = tree.insert(&[outer], Box::new(LoopController::new("inner", 1)));
        let target = tree.insert(&[outer, inner], sampler("t"));
        tree.insert(&[outer, inner], sampler("after"));

        let mut finder = FindAncestors::new(target);
        tree.traverse(&mut finder);
        assert_eq!(finder.controllers_to_root(tree.arena()), vec![inner, outer]);
    }

    #[test]
    fn taking_a_node_leaves_the_rest_of_the_tree_usable() {
        let mut tree = TestTree::new();
        let root = tree.insert(&[], Box::new(LoopController::new("root", 1)));
        let s = tree.insert(&[root], sampler("s"));
        tree.with_node_mut(root, |el| {
            el.as_controller_mut().unwrap().add_child(s);
        });

        let seen = tree.with_taken(root, |el, tree| {
            assert!(el.as_controller().is_some());
            tree.name(s)
        });
        assert_eq!(seen, "s");
        // The root is restored afterwards.
        assert_eq!(tree.name(root), "root");
    }
}
