//! Search tree arena.
//!
//! Nodes refer to their parent by index; the arena owns every node for the
//! duration of one search so backtracking never has to rebuild state.

use crate::resolve::candidate::CandidateSet;
use crate::resolve::trial::TrialResult;
use crate::sandbox::SnapshotHandle;
use serde::Serialize;
use std::sync::Arc;

pub type NodeId = usize;

/// Lifecycle of one trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Pending,
    Running,
    /// Success predicate held and nothing unexplained remained
    Succeeded,
    /// Behavior changed but not yet successful; children get expanded
    Improved,
    /// Same exit status and missing-file multiset as the parent
    NoChange,
    /// Subtree fully explored without a solution
    Exhausted,
    /// Tracer or sandbox fault; a dead end
    Aborted,
    /// Abandoned because siblings already covered the requested solutions
    Cancelled,
}

impl TrialState {
    /// Whether the trial ran to completion and produced a result
    pub fn has_result(&self) -> bool {
        matches!(
            self,
            TrialState::Succeeded | TrialState::Improved | TrialState::NoChange | TrialState::Exhausted
        )
    }
}

#[derive(Debug)]
pub struct SearchNode {
    pub id: NodeId,
    pub candidates: CandidateSet,
    /// Package this node added to its parent's set
    pub package: Option<String>,
    pub parent: Option<NodeId>,
    pub depth: usize,
    pub children: Vec<NodeId>,
    pub expanded: bool,
    pub state: TrialState,
    pub result: Option<Arc<TrialResult>>,
    /// Live while the node's subtree is being explored
    pub snapshot: Option<SnapshotHandle>,
    /// Solutions recorded before this node's subtree was entered
    pub solutions_before: usize,
}

#[derive(Debug, Default)]
pub struct SearchTree {
    nodes: Vec<SearchNode>,
}

impl SearchTree {
    /// Tree holding only the root for `base`
    pub fn new(base: CandidateSet) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.push(base, None, None);
        tree
    }

    fn push(&mut self, candidates: CandidateSet, package: Option<String>, parent: Option<NodeId>) -> NodeId {
        let id = self.nodes.len();
        let depth = parent.map(|p| self.nodes[p].depth + 1).unwrap_or(0);
        self.nodes.push(SearchNode {
            id,
            candidates,
            package,
            parent,
            depth,
            children: Vec::new(),
            expanded: false,
            state: TrialState::Pending,
            result: None,
            snapshot: None,
            solutions_before: 0,
        });
        id
    }

    pub fn root(&self) -> NodeId {
        0
    }

    /// Add a pending child that installs `package` on top of `parent`
    pub fn add_child(&mut self, parent: NodeId, package: &str) -> NodeId {
        let candidates = self.nodes[parent].candidates.with(package);
        let id = self.push(candidates, Some(package.to_string()), Some(parent));
        self.nodes[parent].children.push(id);
        id
    }

    pub fn get(&self, id: NodeId) -> &SearchNode {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut SearchNode {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SearchNode> {
        self.nodes.iter()
    }

    /// Node ids from the root down to `id`
    pub fn path_from_root(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut current = id;
        while let Some(parent) = self.nodes[current].parent {
            path.push(parent);
            current = parent;
        }
        path.reverse();
        path
    }

    /// Pending siblings after `id`, in order
    pub fn later_siblings(&self, id: NodeId) -> Vec<NodeId> {
        let Some(parent) = self.nodes[id].parent else {
            return Vec::new();
        };
        let children = &self.nodes[parent].children;
        children
            .iter()
            .skip_while(|c| **c != id)
            .skip(1)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_grow_monotonically() {
        let mut tree = SearchTree::new(CandidateSet::new());
        let root = tree.root();
        let a = tree.add_child(root, "a");
        let ab = tree.add_child(a, "b");

        assert_eq!(tree.get(ab).depth, 2);
        assert_eq!(tree.get(ab).candidates.to_string(), "a, b");
        assert_eq!(tree.path_from_root(ab), vec![root, a, ab]);
        for window in tree.path_from_root(ab).windows(2) {
            let (upper, lower) = (tree.get(window[0]), tree.get(window[1]));
            assert!(lower.candidates.is_strict_superset_of(&upper.candidates));
        }
    }

    #[test]
    fn test_later_siblings() {
        let mut tree = SearchTree::new(CandidateSet::new());
        let a = tree.add_child(0, "a");
        let b = tree.add_child(0, "b");
        let c = tree.add_child(0, "c");
        assert_eq!(tree.later_siblings(a), vec![b, c]);
        assert_eq!(tree.later_siblings(c), Vec::<NodeId>::new());
        assert!(tree.later_siblings(0).is_empty());
    }

    #[test]
    fn test_state_results() {
        assert!(TrialState::NoChange.has_result());
        assert!(!TrialState::Aborted.has_result());
        assert!(!TrialState::Cancelled.has_result());
    }
}
