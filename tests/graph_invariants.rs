use nodeplay::graph::GraphBuilder;
use nodeplay::invariant_ppt::{
    contract_test, GRAPH_DEDUPLICATED, GRAPH_POSTORDER, GRAPH_REJECTS_CYCLE,
    GRAPH_REJECTS_INVALID, PREPARE_DEPENDENCIES, PREPARE_INPUTS_FIRST, PREPARE_LEAVES_FIRST,
};
use nodeplay::nodes::{ConstantNode, ForwardingNode, GainNode, SilentNode, SummingNode};
use nodeplay::plan::prepare_graph;
use nodeplay::{GraphError, NodeId};

#[test]
fn no_cycles() {
    let mut graph = GraphBuilder::new();
    // 0 reads 2, 1 reads 0, 2 reads 1.
    let a = graph.add_node(ForwardingNode::new(NodeId(2)));
    let b = graph.add_node(ForwardingNode::new(a));
    let c = graph.add_node(ForwardingNode::new(b));
    assert!(matches!(graph.build(c), Err(GraphError::CycleDetected(_))));
    contract_test("cycle rejected", &[GRAPH_REJECTS_CYCLE]);
}

#[test]
fn inputs_must_exist() {
    let mut graph = GraphBuilder::new();
    let gain = graph.add_node(GainNode::new(NodeId(5), 1.0));
    assert_eq!(graph.build(gain).unwrap_err(), GraphError::InvalidNode(NodeId(5)));
    contract_test("dangling input rejected", &[GRAPH_REJECTS_INVALID]);
}

#[test]
fn fan_out_is_allowed() {
    // One output may feed any number of consumers.
    let mut graph = GraphBuilder::new();
    let src = graph.add_node(ConstantNode::new(1, 1.0));
    let g1 = graph.add_node(GainNode::new(src, 1.0));
    let g2 = graph.add_node(GainNode::new(src, 1.0));
    let g3 = graph.add_node(GainNode::new(src, 1.0));
    let sum = graph.add_node(SummingNode::new(vec![g1, g2, g3]));
    let graph = graph.build(sum).unwrap();
    assert_eq!(graph.len(), 5);
    contract_test("fan out", &[GRAPH_POSTORDER, GRAPH_DEDUPLICATED]);
}

#[test]
fn node_ids_stable_monotonic() {
    let mut graph = GraphBuilder::new();
    let node1 = graph.add_node(SilentNode::new(1));
    let node2 = graph.add_node(SilentNode::new(1));
    assert_eq!(node1, NodeId(0));
    assert_eq!(node2, NodeId(1));
    graph.remove_node(node1).unwrap();
    // Removed ids are not reused.
    let node3 = graph.add_node(SilentNode::new(1));
    assert_eq!(node3, NodeId(2));
    assert_eq!(graph.len(), 2);
}

#[test]
fn remove_node_invalidates_consumers() {
    let mut graph = GraphBuilder::new();
    let src = graph.add_node(SilentNode::new(1));
    let fwd = graph.add_node(ForwardingNode::new(src));
    graph.remove_node(src).unwrap();
    assert_eq!(graph.build(fwd).unwrap_err(), GraphError::InvalidNode(src));
}

#[test]
fn prepare_enforces_dependency_order() {
    let mut graph = GraphBuilder::new();
    let a = graph.add_node(ConstantNode::new(2, 0.5));
    let b = graph.add_node(SilentNode::new(2));
    let fa = graph.add_node(ForwardingNode::new(a));
    let sum = graph.add_node(SummingNode::new(vec![fa, b]));
    let prepared = prepare_graph(graph.build(sum).unwrap(), 48_000.0, 128).unwrap();

    // Leaves first: the two sources lead.
    assert!(prepared.inputs_of(0).is_empty());
    assert!(prepared.inputs_of(1).is_empty());
    assert_eq!(prepared.root_index(), 3);
    assert_eq!(prepared.root_properties().number_of_channels, 2);
    contract_test(
        "prepare",
        &[PREPARE_INPUTS_FIRST, PREPARE_DEPENDENCIES, PREPARE_LEAVES_FIRST],
    );
}
