//! Renders two seconds of a looped chord with the multi-threaded player
//! and writes it to `render.wav`.
//!
//! `RUST_LOG=nodeplay=debug cargo run --example render_wav`

use nodeplay::graph::GraphBuilder;
use nodeplay::nodes::{GainNode, SinNode, SummingNode};
use nodeplay::{
    player_pair, AudioBuffer, MidiBuffer, PlayHead, PlayerConfig, PlayerContext, SampleRange,
};
use std::error::Error;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const SAMPLE_RATE: u32 = 44_100;
const BLOCK: usize = 512;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut b = GraphBuilder::new();
    let voices = [261.63, 329.63, 392.0]
        .into_iter()
        .map(|frequency| {
            let osc = b.add_node(SinNode::new(frequency, 2));
            b.add_node(GainNode::new(osc, 0.25))
        })
        .collect();
    let mix = b.add_node(SummingNode::new(voices));
    let graph = b.build(mix)?;

    let config = PlayerConfig::default().with_threads(PlayerConfig::recommended_threads().min(4));
    let (mut controller, mut player) = player_pair(config)?;
    let play_head = Arc::new(PlayHead::new());
    // Half a second, looped.
    play_head.play(SampleRange::new(0, i64::from(SAMPLE_RATE / 2)), true);
    player.set_play_head(Some(Arc::clone(&play_head)));
    controller.set_node_with(graph, f64::from(SAMPLE_RATE), BLOCK)?;

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create("render.wav", spec)?;
    let mut audio = AudioBuffer::new(2, BLOCK);
    let mut midi = MidiBuffer::with_capacity(16);
    let total = 2 * SAMPLE_RATE as usize;
    let mut reference = 0;
    while reference < total {
        let n = (total - reference).min(BLOCK);
        audio.clear();
        let range = SampleRange::with_length(reference as i64, n as i64);
        player.process(&mut PlayerContext::new(n, range, &mut audio, &mut midi));
        for frame in 0..n {
            for channel in 0..2 {
                let sample = audio.channel(channel)[frame].clamp(-1.0, 1.0);
                writer.write_sample((sample * 32767.0) as i16)?;
            }
        }
        reference += n;
    }
    writer.finalize()?;

    // Frees retired graphs and logs what the audio thread recorded.
    let events = controller.collect_garbage();
    tracing::info!(threads = controller.num_threads(), events = events.len(), "wrote render.wav");
    println!("{}", toml::to_string(&controller.stats())?);
    Ok(())
}
