//! layerstat-rs CLI: weight / gradient / activation distributions across a sweep

use anyhow::Result;
use candle_core::Device;
use clap::Parser;
use layerstat::{summarize, ActivationKind, InitMode, ModelType, Sweep, SweepConfig};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "layerstat-rs")]
#[command(about = "Layer-wise weight, gradient and activation statistics of MLP vs EMLP")]
#[command(version)]
struct Cli {
    /// Sweep config JSON (flags below override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory for the grand tables
    #[arg(short, long, default_value = "outputs")]
    output: PathBuf,

    /// Architectures to compare (comma separated: mlp,emlp)
    #[arg(long, value_delimiter = ',')]
    model_types: Option<Vec<ModelType>>,

    /// Initialization modes (comma separated, e.g. fan_in,normal0.1)
    #[arg(long, value_delimiter = ',')]
    init_modes: Option<Vec<InitMode>>,

    /// Hidden blocks between input block and head
    #[arg(long)]
    num_layers: Option<usize>,

    /// Hidden width
    #[arg(long)]
    num_channels: Option<usize>,

    /// Samples in the measured batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Nonlinearity of the hidden blocks
    #[arg(long)]
    activation: Option<ActivationKind>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,
}

impl Cli {
    fn sweep_config(&self) -> Result<SweepConfig> {
        let mut config = match &self.config {
            Some(path) => SweepConfig::load(path)?,
            None => SweepConfig::default(),
        };
        if let Some(model_types) = &self.model_types {
            config.model_types.clone_from(model_types);
        }
        if let Some(init_modes) = &self.init_modes {
            config.init_modes.clone_from(init_modes);
        }
        if let Some(num_layers) = self.num_layers {
            config.num_layers = num_layers;
        }
        if let Some(num_channels) = self.num_channels {
            config.num_channels = num_channels;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(activation) = self.activation {
            config.activation = activation;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.sweep_config()?;
    let device = if cli.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };

    println!("=== layerstat-rs: layer distributions ===");
    println!("Models: {:?}", config.model_types);
    println!("Inits:  {:?}", config.init_modes);
    println!(
        "Layers: {}  Hidden channels: {}  Act: {}",
        config.total_layers(),
        config.num_channels,
        config.activation
    );
    println!("Output: {}", cli.output.display());

    let sweep = Sweep::from_config(config, &device)?;
    let results = sweep.run()?;

    println!("\n=== Summary ===");
    for table in [&results.weights, &results.gradients, &results.activations] {
        println!("\n{}:", table.family().value_column());
        for s in summarize(table) {
            println!(
                "  {:>5} {:>15} layer {:2} {:>10}: n={:<6} mean={:+.4} std={:.4} [{:+.3}, {:+.3}]",
                s.model_type.as_deref().unwrap_or("-"),
                s.init_mode.as_deref().unwrap_or("-"),
                s.layer,
                s.param,
                s.count,
                s.mean,
                s.std_dev,
                s.min,
                s.max
            );
        }
    }

    // Save results
    std::fs::create_dir_all(&cli.output)?;
    for (name, table) in [
        ("weights.json", &results.weights),
        ("gradients.json", &results.gradients),
        ("activations.json", &results.activations),
    ] {
        let path = cli.output.join(name);
        table.write_json(&path)?;
        info!("{} rows saved to {}", table.len(), path.display());
    }

    let summary_path = cli.output.join("summary.json");
    let summary: Vec<_> = [&results.weights, &results.gradients, &results.activations]
        .into_iter()
        .flat_map(summarize)
        .collect();
    std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;
    info!("Summary saved to {}", summary_path.display());

    Ok(())
}
