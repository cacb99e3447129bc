use nodeplay::graph::GraphBuilder;
use nodeplay::nodes::{GainNode, LatencyNode, MidiNode, SinNode, SummingNode};
use nodeplay::{render_offline, NodeGraph, NodePlayer};
use std::f64::consts::TAU;

fn sine_graph() -> NodeGraph {
    let mut b = GraphBuilder::new();
    let osc = b.add_node(SinNode::new(440.0, 1));
    b.build(osc).unwrap()
}

fn prepared(graph: NodeGraph, block_size: usize) -> NodePlayer {
    let mut player = NodePlayer::new();
    player.set_node(graph).unwrap();
    player.prepare_to_play(44_100.0, block_size).unwrap();
    player
}

#[test]
fn offline_render_matches_formula() {
    let mut player = prepared(sine_graph(), 64);
    let (audio, _) = render_offline(&mut player, 44_100, 1);
    for (n, &sample) in audio.channel(0).iter().enumerate() {
        let expected = (TAU * 440.0 * n as f64 / 44_100.0).sin() as f32;
        assert!(
            (sample - expected).abs() < 1e-4,
            "frame {n}: {sample} != {expected}"
        );
    }
}

#[test]
fn offline_render_determinism() {
    let mut first = prepared(sine_graph(), 64);
    let mut second = prepared(sine_graph(), 64);
    let (a, _) = render_offline(&mut first, 4_096, 1);
    let (b, _) = render_offline(&mut second, 4_096, 1);
    assert!(a.channel(0) == b.channel(0), "offline renders should be identical");
}

#[test]
fn offline_render_partial_block() {
    let mut player = prepared(sine_graph(), 64);
    // Not a multiple of the block size
    let (audio, _) = render_offline(&mut player, 65, 1);
    assert_eq!(audio.num_frames(), 65);
    assert!(audio.channel(0).iter().any(|&x| x != 0.0));
}

#[test]
fn latency_shifts_output() {
    let mut b = GraphBuilder::new();
    let osc = b.add_node(SinNode::new(440.0, 1));
    let late = b.add_node(LatencyNode::new(osc, 100));
    let out = b.add_node(GainNode::new(late, 1.0));
    let mut delayed = prepared(b.build(out).unwrap(), 32);
    let mut direct = prepared(sine_graph(), 32);

    let (late, _) = render_offline(&mut delayed, 1_000, 1);
    let (early, _) = render_offline(&mut direct, 1_000, 1);
    assert!(late.channel(0)[..100].iter().all(|&s| s == 0.0));
    assert!(late.channel(0)[100..] == early.channel(0)[..900]);
}

#[test]
fn midi_lands_on_absolute_frames() {
    let mut b = GraphBuilder::new();
    let notes = b.add_node(MidiNode::new(vec![
        (10, [0x90, 60, 100]),
        (70, [0x80, 60, 0]),
        (130, [0x90, 64, 90]),
    ]));
    let osc = b.add_node(SinNode::new(220.0, 1));
    let mix = b.add_node(SummingNode::new(vec![osc, notes]));
    let mut player = prepared(b.build(mix).unwrap(), 64);

    let (_, midi) = render_offline(&mut player, 192, 1);
    let frames: Vec<u32> = midi.iter().map(|m| m.frame).collect();
    assert_eq!(frames, vec![10, 70, 130]);
}
