use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use embdist_core::config::PlacementConfig;
use embdist_sim::config::{load_placement, SimConfig};
use embdist_sim::logging;
use embdist_sim::simulate::{self, SimulationPlan};

#[derive(Parser)]
#[command(name = "embdist-sim", about = "Run the sparse key distributor on simulated devices")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run distribution steps on one thread per device
    Simulate {
        /// Placement file (JSON, or TOML by extension)
        #[arg(long)]
        placement: Option<PathBuf>,

        /// Global batch sizes, cycled over the steps (comma separated)
        #[arg(long = "batch-size", value_delimiter = ',')]
        batch_sizes: Vec<usize>,

        /// Number of steps
        #[arg(long)]
        steps: Option<usize>,

        /// Keys are drawn from 0..key_space
        #[arg(long)]
        key_space: Option<i64>,

        /// Seed of the synthetic batches
        #[arg(long)]
        seed: Option<u64>,

        /// Feed every device the whole batch
        #[arg(long)]
        full_batch: bool,

        /// Collective receive timeout in milliseconds
        #[arg(long)]
        recv_timeout_ms: Option<u64>,

        /// Write the report here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,

        /// Persist the effective settings to the config file
        #[arg(long)]
        save_config: bool,
    },
    /// Check a placement file and print each device's share of it
    Validate {
        /// Placement file (JSON, or TOML by extension)
        placement: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    // Load config from file first
    let file_config = SimConfig::load();
    if let Some(path) = SimConfig::default_path() {
        if path.exists() {
            eprintln!("Loaded config from: {}", path.display());
        }
    }

    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            placement,
            batch_sizes,
            steps,
            key_space,
            seed,
            full_batch,
            recv_timeout_ms,
            output,
            save_config,
        } => {
            // CLI takes precedence over the file
            let mut config = file_config;
            config.merge(&SimConfig {
                placement,
                batch_sizes: (!batch_sizes.is_empty()).then_some(batch_sizes),
                steps,
                key_space,
                seed,
                full_batch: full_batch.then_some(true),
                recv_timeout_ms,
                log_level: cli.log_level,
            });
            logging::init_with_level(config.log_level_or_default())?;

            let placement_path = config
                .placement
                .clone()
                .context("no placement file given (--placement or config file)")?;
            let placement = load_placement(&placement_path)
                .with_context(|| format!("failed to load {}", placement_path.display()))?;
            info!(path = %placement_path.display(), "Loaded placement");

            let batch_sizes = config
                .batch_sizes
                .clone()
                .unwrap_or_else(|| vec![placement.max_batch_size]);
            let plan = SimulationPlan {
                batch_sizes,
                steps: config.steps_or_default(),
                key_space: config.key_space_or_default(),
                seed: config.seed_or_default(),
                full_batch: config.full_batch.unwrap_or(false),
                recv_timeout: Duration::from_millis(config.recv_timeout_ms_or_default()),
                placement,
            };

            if save_config {
                let path = config.save()?;
                info!(path = %path.display(), "Saved config");
            }

            let report = simulate::run(&plan)?;
            let json = serde_json::to_string_pretty(&report)?;
            match output {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => println!("{json}"),
            }
        }
        Command::Validate { placement } => {
            logging::init_with_level(
                cli.log_level
                    .as_deref()
                    .unwrap_or(file_config.log_level_or_default()),
            )?;
            let config = load_placement(&placement)
                .with_context(|| format!("failed to load {}", placement.display()))?;
            print_layout(&config);
        }
    }

    Ok(())
}

fn print_layout(config: &PlacementConfig) {
    println!(
        "{} devices, {} lookups, {} tables, {} groups, max batch {}",
        config.num_devices,
        config.num_lookups(),
        config.tables.len(),
        config.groups.len(),
        config.max_batch_size
    );
    for device in 0..config.num_devices {
        println!("device {device}: tables {:?}", config.resident_tables(device));
        for (group_id, group) in config.groups.iter().enumerate() {
            println!(
                "  group {group_id} ({}): lookups {:?}",
                group.mode,
                config.local_lookups(group_id, device)
            );
        }
    }
}
