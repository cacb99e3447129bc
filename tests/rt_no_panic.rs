use nodeplay::graph::GraphBuilder;
use nodeplay::nodes::{FunctionNode, GainNode, LatencyNode, MidiNode, SinNode, SummingNode};
use nodeplay::{
    player_pair, AudioBuffer, MidiBuffer, NodeGraph, NodePlayer, PlayHead, PlayerConfig,
    PlayerContext, SampleRange,
};
use proptest::prelude::*;
use std::sync::Arc;

fn graph() -> NodeGraph {
    let mut b = GraphBuilder::new();
    let osc = b.add_node(SinNode::new(330.0, 2));
    let late = b.add_node(LatencyNode::new(osc, 37));
    let clipped = b.add_node(FunctionNode::new(osc, |s| s.clamp(-0.5, 0.5)));
    let quiet = b.add_node(GainNode::new(clipped, 0.3));
    let notes = b.add_node(MidiNode::new(vec![(5, [0x90, 60, 100]), (900, [0x80, 60, 0])]));
    let sum = b.add_node(SummingNode::new(vec![late, quiet, notes]));
    b.build(sum).unwrap()
}

fn check(audio: &AudioBuffer) -> Result<(), TestCaseError> {
    for channel in audio.channels() {
        prop_assert!(channel.iter().all(|s| s.is_finite()));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn node_player_survives_any_block_length(
        block_size in 1usize..512,
        lengths in prop::collection::vec(0usize..3000, 1..8),
        looping in any::<bool>(),
    ) {
        let play_head = Arc::new(PlayHead::new());
        play_head.play(SampleRange::new(0, 777), looping);
        let mut player = NodePlayer::with_play_head(play_head);
        player.set_node(graph()).unwrap();
        player.prepare_to_play(48_000.0, block_size).unwrap();

        let mut audio = AudioBuffer::new(2, 3000);
        let mut midi = MidiBuffer::with_capacity(64);
        let mut reference = 0i64;
        for n in lengths {
            audio.clear();
            midi.clear();
            let range = SampleRange::with_length(reference, n as i64);
            player.process(&mut PlayerContext::new(n, range, &mut audio, &mut midi));
            check(&audio)?;
            reference += n as i64;
        }
    }

    #[test]
    fn parallel_player_survives_any_block_length(
        block_size in 1usize..512,
        lengths in prop::collection::vec(0usize..3000, 1..8),
        threads in 0usize..3,
    ) {
        let (mut controller, mut player) =
            player_pair(PlayerConfig::default().with_threads(threads)).unwrap();
        controller.set_node_with(graph(), 48_000.0, block_size).unwrap();

        let mut audio = AudioBuffer::new(2, 3000);
        let mut midi = MidiBuffer::with_capacity(64);
        let mut reference = 0i64;
        for n in lengths {
            audio.clear();
            midi.clear();
            let range = SampleRange::with_length(reference, n as i64);
            player.process(&mut PlayerContext::new(n, range, &mut audio, &mut midi));
            check(&audio)?;
            reference += n as i64;
        }
        controller.collect_garbage();
    }
}
