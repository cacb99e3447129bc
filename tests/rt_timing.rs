use nodeplay::graph::GraphBuilder;
use nodeplay::nodes::{GainNode, SinNode};
use nodeplay::{
    player_pair, AudioBuffer, MidiBuffer, NodeGraph, NodePlayer, PlayerConfig, PlayerContext,
    SampleRange,
};
use std::time::Instant;

// Worst-case graph: chain of gains
fn chain() -> NodeGraph {
    let mut b = GraphBuilder::new();
    let mut prev = b.add_node(SinNode::new(440.0, 1));
    for _ in 0..10 {
        prev = b.add_node(GainNode::new(prev, 1.0));
    }
    b.build(prev).unwrap()
}

fn render(mut process: impl FnMut(&mut PlayerContext<'_>)) -> u128 {
    let mut audio = AudioBuffer::new(1, 64);
    let mut midi = MidiBuffer::with_capacity(4);
    let start = Instant::now();
    for block in 0..1000 {
        let range = SampleRange::with_length(block * 64, 64);
        process(&mut PlayerContext::new(64, range, &mut audio, &mut midi));
    }
    start.elapsed().as_millis()
}

#[test]
fn rt_timing_stability() {
    let mut player = NodePlayer::new();
    player.set_node(chain()).unwrap();
    player.prepare_to_play(44_100.0, 64).unwrap();

    let millis = render(|ctx| {
        player.process(ctx);
    });
    // Bounded: less than 1 second for 1000 blocks
    assert!(millis < 1000, "execution took too long: {millis}ms");
}

#[test]
fn rt_timing_stability_with_workers() {
    let (mut controller, mut player) = player_pair(PlayerConfig::default().with_threads(2)).unwrap();
    controller.set_node_with(chain(), 44_100.0, 64).unwrap();

    let millis = render(|ctx| {
        player.process(ctx);
    });
    assert!(millis < 2000, "execution took too long: {millis}ms");
    controller.collect_garbage();
}
