use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nodeplay::graph::GraphBuilder;
use nodeplay::nodes::{GainNode, SinNode, SummingNode};
use nodeplay::{
    player_pair, AudioBuffer, MidiBuffer, NodeGraph, NodePlayer, PlayerConfig, PlayerContext,
    SampleRange,
};

const BLOCK: usize = 512;

fn chain() -> NodeGraph {
    let mut b = GraphBuilder::new();
    let mut prev = b.add_node(SinNode::new(440.0, 2));
    for _ in 0..10 {
        prev = b.add_node(GainNode::new(prev, 1.0));
    }
    b.build(prev).unwrap()
}

/// Sixteen independent oscillator chains summed at the root.
fn wide() -> NodeGraph {
    let mut b = GraphBuilder::new();
    let voices = (0..16)
        .map(|i| {
            let mut prev = b.add_node(SinNode::new(110.0 * (i + 1) as f64, 2));
            for _ in 0..4 {
                prev = b.add_node(GainNode::new(prev, 0.9));
            }
            prev
        })
        .collect();
    let sum = b.add_node(SummingNode::new(voices));
    b.build(sum).unwrap()
}

fn bench_node_player(c: &mut Criterion) {
    for (name, graph) in [("node_player_chain", chain()), ("node_player_wide", wide())] {
        let mut player = NodePlayer::new();
        player.set_node(graph).unwrap();
        player.prepare_to_play(44_100.0, BLOCK).unwrap();
        let mut audio = AudioBuffer::new(2, BLOCK);
        let mut midi = MidiBuffer::with_capacity(16);
        let mut reference = 0i64;

        c.bench_function(name, |b| {
            b.iter(|| {
                audio.clear();
                let range = SampleRange::with_length(reference, BLOCK as i64);
                player.process(&mut PlayerContext::new(BLOCK, range, &mut audio, &mut midi));
                reference += BLOCK as i64;
                black_box(&audio);
            })
        });
    }
}

fn bench_parallel_player(c: &mut Criterion) {
    for threads in [0, 2, 4] {
        let (mut controller, mut player) =
            player_pair(PlayerConfig::default().with_threads(threads)).unwrap();
        controller.set_node_with(wide(), 44_100.0, BLOCK).unwrap();
        let mut audio = AudioBuffer::new(2, BLOCK);
        let mut midi = MidiBuffer::with_capacity(16);
        let mut reference = 0i64;

        c.bench_function(&format!("parallel_player_wide_{threads}_threads"), |b| {
            b.iter(|| {
                audio.clear();
                let range = SampleRange::with_length(reference, BLOCK as i64);
                player.process(&mut PlayerContext::new(BLOCK, range, &mut audio, &mut midi));
                reference += BLOCK as i64;
                black_box(&audio);
            })
        });
        controller.collect_garbage();
    }
}

criterion_group!(benches, bench_node_player, bench_parallel_player);
criterion_main!(benches);
