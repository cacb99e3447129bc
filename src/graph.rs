//! Graph module: node arenas and their topological form.
//!
//! Nodes are added to a [`GraphBuilder`], which hands out [`NodeId`]s that
//! other nodes use to declare their inputs. [`GraphBuilder::build`] walks
//! everything reachable from a chosen root and produces a [`NodeGraph`]:
//! each node exactly once, in postorder, so every node comes after all of
//! its inputs. Nodes the root cannot reach are dropped.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use crate::error::GraphError;
use crate::invariant_ppt::{
    assert_invariant, GRAPH_DEDUPLICATED, GRAPH_POSTORDER, GRAPH_REJECTS_CYCLE,
    GRAPH_REJECTS_INVALID,
};
pub use crate::node::NodeId;
use crate::node::Node;
use std::collections::VecDeque;
use std::fmt::{self, Write};

/// Arena of nodes awaiting a root.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<Option<Box<dyn Node>>>,
}

impl GraphBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns the id other nodes use to reference it.
    pub fn add_node<N: Node>(&mut self, node: N) -> NodeId {
        self.add_boxed(Box::new(node))
    }

    /// Adds an already boxed node.
    pub fn add_boxed(&mut self, node: Box<dyn Node>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(node));
        id
    }

    /// Takes a node back out of the builder. Its id stays reserved.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Box<dyn Node>, GraphError> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(GraphError::InvalidNode(id))
    }

    /// Nodes currently held.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// True if no nodes are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn node(&self, id: NodeId) -> Result<&dyn Node, GraphError> {
        self.nodes
            .get(id.0)
            .and_then(|n| n.as_deref())
            .ok_or(GraphError::InvalidNode(id))
    }

    /// Builds the graph reachable from `root`.
    ///
    /// Fails with [`GraphError::InvalidNode`] if a reachable node names an
    /// input that does not exist, and with [`GraphError::CycleDetected`] if
    /// the reachable nodes are not acyclic.
    pub fn build(mut self, root: NodeId) -> Result<NodeGraph, GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            OnPath,
            Done,
        }

        let mut marks = vec![Mark::New; self.nodes.len()];
        let mut declared: Vec<Vec<NodeId>> = vec![Vec::new(); self.nodes.len()];
        let mut postorder: Vec<NodeId> = Vec::new();

        let root_inputs = match self.node(root) {
            Ok(node) => node.direct_input_nodes(),
            Err(e) => {
                assert_invariant(GRAPH_REJECTS_INVALID, true, "missing root rejected", None);
                return Err(e);
            }
        };
        declared[root.0] = root_inputs;
        marks[root.0] = Mark::OnPath;

        // Explicit stack of (node, next input to visit) keeps deep chains off
        // the call stack.
        let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
        while let Some((current, next)) = stack.last_mut() {
            let current = *current;
            if let Some(&input) = declared[current.0].get(*next) {
                *next += 1;
                let node = match self.node(input) {
                    Ok(node) => node,
                    Err(e) => {
                        assert_invariant(
                            GRAPH_REJECTS_INVALID,
                            true,
                            "dangling input rejected",
                            None,
                        );
                        return Err(e);
                    }
                };
                match marks[input.0] {
                    Mark::New => {
                        declared[input.0] = node.direct_input_nodes();
                        marks[input.0] = Mark::OnPath;
                        stack.push((input, 0));
                    }
                    Mark::OnPath => {
                        assert_invariant(GRAPH_REJECTS_CYCLE, true, "cycle rejected", None);
                        return Err(GraphError::CycleDetected(input));
                    }
                    Mark::Done => {}
                }
            } else {
                marks[current.0] = Mark::Done;
                postorder.push(current);
                stack.pop();
            }
        }

        let mut position = vec![usize::MAX; self.nodes.len()];
        for (index, id) in postorder.iter().enumerate() {
            position[id.0] = index;
        }

        let inputs: Vec<Vec<usize>> = postorder
            .iter()
            .map(|id| declared[id.0].iter().map(|i| position[i.0]).collect())
            .collect();
        assert_invariant(
            GRAPH_POSTORDER,
            inputs
                .iter()
                .enumerate()
                .all(|(index, ins)| ins.iter().all(|&i| i < index)),
            "input ordered after its consumer",
            Some("build"),
        );

        let mut nodes = Vec::with_capacity(postorder.len());
        for id in &postorder {
            match self.nodes[id.0].take() {
                Some(node) => nodes.push(node),
                None => unreachable!("node {id:?} visited twice"),
            }
        }
        assert_invariant(
            GRAPH_DEDUPLICATED,
            nodes.len() == postorder.len(),
            "node emitted twice",
            Some("build"),
        );

        let dropped = self.len();
        if dropped > 0 {
            tracing::debug!(dropped, "discarded nodes unreachable from root");
        }

        Ok(NodeGraph {
            root: nodes.len() - 1,
            nodes,
            inputs,
            ids: postorder,
        })
    }
}

impl fmt::Debug for GraphBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphBuilder")
            .field("nodes", &self.len())
            .finish()
    }
}

/// Order in which [`NodeGraph::nodes_in_order`] lists nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexOrdering {
    /// Depth first, each node before its inputs.
    Preordering,
    /// Depth first, each node after its inputs.
    Postordering,
    /// Reverse of [`Preordering`](Self::Preordering).
    ReversePreordering,
    /// Reverse of [`Postordering`](Self::Postordering).
    ReversePostordering,
    /// Breadth first from the root.
    BfsPreordering,
    /// Reverse of [`BfsPreordering`](Self::BfsPreordering).
    BfsReversePreordering,
}

/// An acyclic, deduplicated graph in postorder. The root is last.
pub struct NodeGraph {
    nodes: Vec<Box<dyn Node>>,
    inputs: Vec<Vec<usize>>,
    ids: Vec<NodeId>,
    root: usize,
}

impl NodeGraph {
    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false for a built graph; it holds at least its root.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Index of the root; always `len() - 1`.
    pub fn root_index(&self) -> usize {
        self.root
    }

    /// Inputs of the node at `index`, as indices into this graph.
    pub fn inputs_of(&self, index: usize) -> &[usize] {
        &self.inputs[index]
    }

    /// The id the node at `index` had in its builder.
    pub fn builder_id(&self, index: usize) -> NodeId {
        self.ids[index]
    }

    /// Position of a builder id in this graph, if it was reachable.
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.ids.iter().position(|&i| i == id)
    }

    /// Display name of the node at `index`.
    pub fn node_name(&self, index: usize) -> &str {
        self.nodes[index].name()
    }

    /// Node indices in the requested order, starting from the root.
    pub fn nodes_in_order(&self, ordering: VertexOrdering) -> Vec<usize> {
        let mut order = match ordering {
            VertexOrdering::Postordering | VertexOrdering::ReversePostordering => {
                (0..self.len()).collect()
            }
            VertexOrdering::Preordering | VertexOrdering::ReversePreordering => self.preorder(),
            VertexOrdering::BfsPreordering | VertexOrdering::BfsReversePreordering => self.bfs(),
        };
        if matches!(
            ordering,
            VertexOrdering::ReversePostordering
                | VertexOrdering::ReversePreordering
                | VertexOrdering::BfsReversePreordering
        ) {
            order.reverse();
        }
        order
    }

    fn preorder(&self) -> Vec<usize> {
        let mut seen = vec![false; self.len()];
        let mut order = Vec::with_capacity(self.len());
        let mut stack = vec![self.root];
        while let Some(index) = stack.pop() {
            if std::mem::replace(&mut seen[index], true) {
                continue;
            }
            order.push(index);
            stack.extend(self.inputs[index].iter().rev().filter(|&&i| !seen[i]));
        }
        order
    }

    fn bfs(&self) -> Vec<usize> {
        let mut seen = vec![false; self.len()];
        let mut order = Vec::with_capacity(self.len());
        let mut queue = VecDeque::from([self.root]);
        seen[self.root] = true;
        while let Some(index) = queue.pop_front() {
            order.push(index);
            for &input in &self.inputs[index] {
                if !std::mem::replace(&mut seen[input], true) {
                    queue.push_back(input);
                }
            }
        }
        order
    }

    /// Graphviz description, edges pointing from input to consumer.
    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph {\n");
        for (index, node) in self.nodes.iter().enumerate() {
            let _ = writeln!(dot, "  n{index} [label=\"{}\"];", node.name());
        }
        for (index, inputs) in self.inputs.iter().enumerate() {
            for input in inputs {
                let _ = writeln!(dot, "  n{input} -> n{index};");
            }
        }
        dot.push_str("}\n");
        dot
    }

    pub(crate) fn into_parts(self) -> (Vec<Box<dyn Node>>, Vec<Vec<usize>>, Vec<NodeId>, usize) {
        (self.nodes, self.inputs, self.ids, self.root)
    }

    /// Reassembles a graph from parts already known to be in postorder.
    pub(crate) fn from_parts(
        nodes: Vec<Box<dyn Node>>,
        inputs: Vec<Vec<usize>>,
        ids: Vec<NodeId>,
        root: usize,
    ) -> Self {
        debug_assert_eq!(nodes.len(), inputs.len());
        debug_assert!(inputs
            .iter()
            .enumerate()
            .all(|(index, ins)| ins.iter().all(|&i| i < index)));
        Self {
            nodes,
            inputs,
            ids,
            root,
        }
    }
}

impl fmt::Debug for NodeGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeGraph")
            .field("nodes", &self.len())
            .field("inputs", &self.inputs)
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{ForwardingNode, SilentNode, SummingNode};
    use proptest::prelude::*;

    #[test]
    fn chain_is_postordered() {
        let mut b = GraphBuilder::new();
        let a = b.add_node(SilentNode::new(1));
        let f1 = b.add_node(ForwardingNode::new(a));
        let f2 = b.add_node(ForwardingNode::new(f1));
        let g = b.build(f2).unwrap();
        assert_eq!(g.len(), 3);
        assert_eq!(g.builder_id(0), a);
        assert_eq!(g.builder_id(2), f2);
        assert_eq!(g.inputs_of(2), &[1]);
    }

    #[test]
    fn shared_input_appears_once() {
        let mut b = GraphBuilder::new();
        let src = b.add_node(SilentNode::new(1));
        let l = b.add_node(ForwardingNode::new(src));
        let r = b.add_node(ForwardingNode::new(src));
        let sum = b.add_node(SummingNode::new(vec![l, r, src]));
        let g = b.build(sum).unwrap();
        assert_eq!(g.len(), 4);
        assert_eq!(g.index_of(src), Some(0));
    }

    #[test]
    fn unreachable_nodes_are_dropped() {
        let mut b = GraphBuilder::new();
        let used = b.add_node(SilentNode::new(1));
        let _unused = b.add_node(SilentNode::new(1));
        let root = b.add_node(ForwardingNode::new(used));
        let g = b.build(root).unwrap();
        assert_eq!(g.len(), 2);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut b = GraphBuilder::new();
        // Node 0 reads node 1, node 1 reads node 0.
        let a = b.add_node(ForwardingNode::new(NodeId(1)));
        let c = b.add_node(ForwardingNode::new(a));
        assert!(matches!(b.build(c), Err(GraphError::CycleDetected(_))));
    }

    #[test]
    fn self_loop_is_rejected() {
        let mut b = GraphBuilder::new();
        let a = b.add_node(ForwardingNode::new(NodeId(0)));
        assert_eq!(b.build(a).unwrap_err(), GraphError::CycleDetected(a));
    }

    #[test]
    fn dangling_input_is_rejected() {
        let mut b = GraphBuilder::new();
        let a = b.add_node(ForwardingNode::new(NodeId(7)));
        assert_eq!(b.build(a).unwrap_err(), GraphError::InvalidNode(NodeId(7)));

        let b = GraphBuilder::new();
        assert_eq!(b.build(NodeId(0)).unwrap_err(), GraphError::InvalidNode(NodeId(0)));
    }

    #[test]
    fn removed_node_is_invalid() {
        let mut b = GraphBuilder::new();
        let a = b.add_node(SilentNode::new(1));
        let f = b.add_node(ForwardingNode::new(a));
        assert!(b.remove_node(a).is_ok());
        assert!(b.remove_node(a).is_err());
        assert_eq!(b.build(f).unwrap_err(), GraphError::InvalidNode(a));
    }

    #[test]
    fn orderings() {
        let mut b = GraphBuilder::new();
        let x = b.add_node(SilentNode::new(1));
        let y = b.add_node(SilentNode::new(1));
        let fy = b.add_node(ForwardingNode::new(y));
        let sum = b.add_node(SummingNode::new(vec![x, fy]));
        let g = b.build(sum).unwrap();
        // Postorder: x, y, fy, sum.
        assert_eq!(g.nodes_in_order(VertexOrdering::Postordering), vec![0, 1, 2, 3]);
        assert_eq!(g.nodes_in_order(VertexOrdering::ReversePostordering), vec![3, 2, 1, 0]);
        assert_eq!(g.nodes_in_order(VertexOrdering::Preordering), vec![3, 0, 2, 1]);
        assert_eq!(g.nodes_in_order(VertexOrdering::BfsPreordering), vec![3, 0, 2, 1]);
        assert_eq!(g.nodes_in_order(VertexOrdering::BfsReversePreordering), vec![1, 2, 0, 3]);
    }

    #[test]
    fn dot_lists_edges() {
        let mut b = GraphBuilder::new();
        let a = b.add_node(SilentNode::new(1));
        let f = b.add_node(ForwardingNode::new(a));
        let dot = b.build(f).unwrap().to_dot();
        assert!(dot.starts_with("digraph {"));
        assert!(dot.contains("n0 -> n1;"));
        assert!(dot.contains("ForwardingNode"));
    }

    proptest! {
        #[test]
        fn random_dags_build_in_postorder(
            edges in proptest::collection::vec((0usize..24, 0usize..24), 0..60),
        ) {
            // Only edges from lower to higher ids, so the builder is acyclic.
            let mut wiring: Vec<Vec<NodeId>> = vec![Vec::new(); 24];
            for (a, b) in edges {
                if a < b && !wiring[b].contains(&NodeId(a)) {
                    wiring[b].push(NodeId(a));
                }
            }
            let mut builder = GraphBuilder::new();
            for inputs in &wiring {
                builder.add_node(SummingNode::new(inputs.clone()));
            }
            let all: Vec<NodeId> = (0..24).map(NodeId).collect();
            let root = builder.add_node(SummingNode::new(all));
            let graph = builder.build(root).unwrap();

            prop_assert_eq!(graph.len(), 25);
            for index in 0..graph.len() {
                prop_assert!(graph.inputs_of(index).iter().all(|&i| i < index));
            }
            let mut ids: Vec<usize> = (0..graph.len()).map(|i| graph.builder_id(i).0).collect();
            ids.sort_unstable();
            ids.dedup();
            prop_assert_eq!(ids.len(), 25);
        }
    }
}
