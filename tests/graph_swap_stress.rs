use nodeplay::graph::GraphBuilder;
use nodeplay::nodes::{ConstantNode, ForwardingNode, GainNode, SummingNode};
use nodeplay::{
    player_pair, AudioBuffer, BlockOutcome, MidiBuffer, NodeGraph, PlayerConfig, PlayerContext,
    SampleRange, SchedulingMode,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const BLOCK: usize = 64;
const SWAPS: usize = 2_000;

/// A graph whose output is `value` everywhere, with a shape that depends
/// on `value` so consecutive graphs differ in size.
fn graph_for(value: usize) -> NodeGraph {
    let mut b = GraphBuilder::new();
    let half = b.add_node(ConstantNode::new(1, 0.5));
    let mut parts = Vec::new();
    for _ in 0..(value % 4) + 1 {
        let chain = b.add_node(ForwardingNode::new(half));
        parts.push(b.add_node(GainNode::new(chain, 1.0)));
    }
    let sum = b.add_node(SummingNode::new(parts));
    // (value % 4 + 1) * 0.5 * gain == value % 4 + 1
    let gained = b.add_node(GainNode::new(sum, 2.0));
    b.build(gained).unwrap()
}

fn run(config: PlayerConfig) {
    let (mut controller, mut player) = player_pair(config).unwrap();
    controller.prepare_to_play(48_000.0, BLOCK).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let audio_thread = {
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut audio = AudioBuffer::new(1, BLOCK);
            let mut midi = MidiBuffer::with_capacity(8);
            let mut processed = 0usize;
            let mut reference = 0i64;
            while !done.load(Ordering::Acquire) {
                audio.clear();
                let mut ctx = PlayerContext::new(
                    BLOCK,
                    SampleRange::with_length(reference, BLOCK as i64),
                    &mut audio,
                    &mut midi,
                );
                reference += BLOCK as i64;
                match player.process(&mut ctx) {
                    BlockOutcome::Processed => {
                        let first = audio.channel(0)[0];
                        assert!((1.0..=4.0).contains(&first), "unexpected level {first}");
                        assert!(audio.channel(0).iter().all(|&s| s == first), "mixed graphs in one block");
                        processed += 1;
                    }
                    BlockOutcome::NoGraph | BlockOutcome::Contended => {
                        assert!(audio.channel(0).iter().all(|&s| s == 0.0));
                    }
                }
            }
            (player, processed)
        })
    };

    for value in 0..SWAPS {
        controller.set_node(graph_for(value)).unwrap();
        if value % 8 == 0 {
            controller.collect_garbage();
        }
        if value % 128 == 0 {
            thread::yield_now();
        }
    }
    // Give the audio thread time to pick up the last graph.
    while controller.stats().graphs_swapped == 0 {
        thread::yield_now();
    }
    done.store(true, Ordering::Release);
    let (player, processed) = audio_thread.join().unwrap();
    drop(player);
    controller.collect_garbage();

    let stats = controller.stats();
    assert!(processed > 0);
    assert!(stats.graphs_swapped > 0);
    // Every swap but the first retired a graph; the last one dropped with
    // the player.
    assert_eq!(stats.graphs_retired, stats.graphs_swapped - 1);
}

#[test]
fn swaps_under_load_single_threaded() {
    run(PlayerConfig::default());
}

#[test]
fn swaps_under_load_with_workers() {
    run(PlayerConfig::default().with_threads(2));
}

#[test]
fn swaps_under_load_with_scan_workers() {
    run(PlayerConfig::default()
        .with_threads(2)
        .with_scheduling(SchedulingMode::Scan));
}
