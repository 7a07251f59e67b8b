//! patchbay CLI - load a patch, render it and report what came out.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use patchbay::config::{BridgeConfig, ConfigError, EngineMode};
use patchbay::{Patch, PatchDocument, RuntimeConfig, Value};

#[derive(Parser)]
#[command(name = "patchbay")]
#[command(author, version, about = "Render a patch document", long_about = None)]
struct Cli {
    /// Patch document (JSON with `nodes` and `edges`)
    patch: PathBuf,

    /// Runtime configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of 64-frame quanta to render
    #[arg(short = 'n', long, default_value_t = 750)]
    quanta: usize,

    /// Bang these nodes' first inlet before rendering
    #[arg(long)]
    bang: Vec<String>,

    /// Play through the default output device instead of rendering offline
    #[cfg(feature = "cpal_sink")]
    #[arg(long)]
    play: bool,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid patch document: {0}")]
    Document(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[cfg(feature = "cpal_sink")]
    #[error(transparent)]
    Device(#[from] patchbay::host::device::DeviceError),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(err) = run(Cli::parse()) {
        tracing::error!(%err, "patchbay failed");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    let text = std::fs::read_to_string(&cli.patch).map_err(|source| CliError::Read {
        path: cli.patch.clone(),
        source,
    })?;
    let document = PatchDocument::from_json(&text)?;

    #[cfg(feature = "cpal_sink")]
    if cli.play {
        return play(&cli, config, &document);
    }

    // Offline renders pump engines inline
    let config = RuntimeConfig {
        bridge: BridgeConfig {
            engine_mode: EngineMode::Inline,
            ..config.bridge
        },
        ..config
    };
    let mut patch = Patch::try_new(config)?;
    patch.load(&document);
    for node in &cli.bang {
        patch.deliver(node, 0, Value::Bang);
    }

    let mut peak = 0.0_f32;
    let mut energy = 0.0_f64;
    let started = Instant::now();
    for quantum in 0..cli.quanta {
        let block = patch.render_quantum();
        peak = block.iter().fold(peak, |m, s| m.max(s.abs()));
        energy += block.iter().map(|&s| f64::from(s) * f64::from(s)).sum::<f64>();
        // Offline render: advance analysis and housekeeping every 16 quanta
        if quantum % 16 == 0 {
            patch.tick(started + Duration::from_secs_f64(patch.now()));
        }
    }
    let frames = (cli.quanta * dasp_graph::Buffer::LEN).max(1);

    report(&patch);
    println!(
        "rendered {:.3}s: peak {:.4}, rms {:.4} ({:?} wall)",
        patch.now(),
        peak,
        (energy / frames as f64).sqrt(),
        started.elapsed()
    );
    patch.shutdown();
    Ok(())
}

fn report(patch: &Patch) {
    let audio = patch.audio();
    for id in audio.node_ids() {
        println!(
            "{id}: {:?} output={}",
            audio.group(id),
            audio.output_of(id).map_or_else(|| "-".to_owned(), |n| n.to_string())
        );
    }
    for connection in audio.connections() {
        match connection.param {
            Some(param) => println!("  {} -> {}.{param}", connection.from, connection.to),
            None => println!("  {} -> {}", connection.from, connection.to),
        }
    }
}

#[cfg(feature = "cpal_sink")]
fn play(cli: &Cli, config: RuntimeConfig, document: &PatchDocument) -> Result<(), CliError> {
    use std::sync::Arc;

    use patchbay::host::device::CpalOutput;
    use patchbay::host::AudioContext;
    use patchbay::object::ObjectRegistry;

    let (output, producer) = CpalOutput::open_default()?;
    let config = RuntimeConfig {
        sample_rate: output.sample_rate(),
        ..config
    };
    let host = AudioContext::new(output.sample_rate()).with_output(producer, output.channels());
    let mut patch = Patch::try_with_context(Arc::new(ObjectRegistry::with_builtins()), config, host)?;
    patch.load(document);
    for node in &cli.bang {
        patch.deliver(node, 0, Value::Bang);
    }

    // Stay a few quanta ahead of the device
    let lead = 8 * dasp_graph::Buffer::LEN;
    let mut rendered = 0;
    for _ in 0..cli.quanta {
        while rendered > output.samples_consumed() / output.channels() + lead {
            std::thread::sleep(Duration::from_millis(1));
        }
        patch.render_quantum();
        rendered += dasp_graph::Buffer::LEN;
        patch.tick(Instant::now());
    }
    tracing::info!(underruns = output.underruns(), "playback finished");
    report(&patch);
    patch.shutdown();
    Ok(())
}
