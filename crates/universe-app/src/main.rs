use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use universe_app::{
    ControlHandle, KnobUpdate, Scheduler, SchedulerOptions, create_command_bus, init_tracing,
    knobs_for, patch_config, updates_to_patch,
};
use universe_core::{RetryPolicy, RetryingStore, Universe, UniverseConfig, UserId};
use universe_storage::{SharedStorage, Storage};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "universe-app",
    version,
    about = "Run and inspect a persistent universe simulation"
)]
struct Cli {
    /// JSON configuration file; missing fields take their defaults.
    #[arg(long, env = "UNIVERSE_CONFIG")]
    config: Option<PathBuf>,

    /// DuckDB database holding particles, traits, events and snapshots.
    #[arg(long, env = "UNIVERSE_DB", default_value = "universe.duckdb")]
    db: PathBuf,

    /// RNG seed; overrides `rng_seed` from the config file.
    #[arg(long, env = "UNIVERSE_SEED")]
    seed: Option<u64>,

    /// Knob override applied on top of the config file (repeatable), e.g. `--set thresholds.bond=0.7`.
    #[arg(long = "set", value_name = "PATH=VALUE")]
    overrides: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduled tick loop.
    Run {
        /// Stop after this many ticks.
        #[arg(long)]
        ticks: Option<u64>,
        /// Override `tick_interval_ms`.
        #[arg(long, env = "UNIVERSE_TICK_INTERVAL_MS")]
        interval_ms: Option<u64>,
        /// Seed this many random particles before the first tick.
        #[arg(long, default_value_t = 0)]
        particles: usize,
        /// Read control commands (tick, status, knobs, set, quit) from stdin.
        #[arg(long)]
        console: bool,
    },
    /// Run ticks immediately and print each snapshot as JSON.
    Tick {
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Spawn random particles with random trait vectors.
    Seed {
        count: usize,
        /// Owning user id; defaults to the nil id.
        #[arg(long)]
        owner: Option<Uuid>,
    },
    /// List all configuration knobs with their effective values.
    Knobs,
    /// Print the most recent archived snapshots, newest first.
    Snapshots {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Knobs => {
            let knobs = knobs_for(&config)?;
            println!("{}", serde_json::to_string_pretty(&knobs)?);
        }
        Command::Snapshots { limit } => {
            let storage = open_storage(&cli.db)?;
            let snapshots = storage.lock()?.recent_snapshots(limit)?;
            println!("{}", serde_json::to_string_pretty(&snapshots)?);
        }
        Command::Seed { count, owner } => {
            let storage = open_storage(&cli.db)?;
            let mut universe = bootstrap_universe(config, &storage)?;
            let ids = universe.seed_particles(count, UserId(owner.unwrap_or_default()), Utc::now())?;
            println!("{}", serde_json::to_string_pretty(&ids)?);
            storage.lock()?.flush()?;
        }
        Command::Tick { count } => {
            let storage = open_storage(&cli.db)?;
            let mut universe = bootstrap_universe(config, &storage)?;
            for _ in 0..count {
                let outcome = universe.run_tick()?;
                println!("{}", serde_json::to_string(&outcome.snapshot)?);
            }
            storage.lock()?.flush()?;
        }
        Command::Run {
            ticks,
            interval_ms,
            particles,
            console,
        } => {
            let mut config = config;
            if let Some(interval_ms) = interval_ms {
                config.tick_interval_ms = interval_ms;
                config.validate().context("invalid tick interval")?;
            }
            let storage = open_storage(&cli.db)?;
            let mut universe = bootstrap_universe(config, &storage)?;
            if particles > 0 {
                universe.seed_particles(particles, UserId::default(), Utc::now())?;
            }
            run_scheduler(universe, ticks, console);
            let mut guard = storage.lock()?;
            guard.flush()?;
            if let Err(err) = guard.optimize() {
                warn!(error = %err, "storage optimize failed");
            }
        }
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<UniverseConfig> {
    let mut config = match &cli.config {
        Some(path) => read_config(path)?,
        None => UniverseConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config.rng_seed = Some(seed);
    }
    if !cli.overrides.is_empty() {
        let updates = cli
            .overrides
            .iter()
            .map(|raw| KnobUpdate::parse_assignment(raw))
            .collect::<Result<Vec<_>, _>>()?;
        config = patch_config(&config, &updates_to_patch(&updates)?)?;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn read_config(path: &Path) -> Result<UniverseConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

fn open_storage(path: &Path) -> Result<SharedStorage> {
    let Some(path_str) = path.to_str() else {
        bail!("database path {} is not valid UTF-8", path.display());
    };
    let storage = Storage::open(path_str)
        .with_context(|| format!("failed to open database {}", path.display()))?;
    Ok(SharedStorage::new(storage))
}

/// Wire a universe to DuckDB and continue numbering after the last archived tick.
fn bootstrap_universe(config: UniverseConfig, storage: &SharedStorage) -> Result<Universe> {
    let particles = RetryingStore::new(storage.clone(), RetryPolicy::default());
    let traits = RetryingStore::new(storage.clone(), RetryPolicy::default());
    let mut universe = Universe::new(config, Box::new(particles), Box::new(traits))?;
    universe.set_event_sink(Box::new(storage.clone()));
    universe.set_broadcast(Box::new(storage.clone()));

    if let Some(last) = storage.lock()?.latest_tick()? {
        universe.resume_from(last);
    }
    Ok(universe)
}

fn run_scheduler(universe: Universe, ticks: Option<u64>, console: bool) {
    let (sender, receiver) = create_command_bus(64);
    let scheduler = Scheduler::new(
        universe,
        receiver,
        SchedulerOptions {
            tick_limit: ticks,
            ..SchedulerOptions::default()
        },
    );
    let handle = ControlHandle::new(scheduler.status(), scheduler.gate(), sender);

    if console {
        let console_handle = handle.clone();
        let spawned = thread::Builder::new()
            .name("universe-console".into())
            .spawn(move || {
                let stdin = io::stdin();
                if let Err(err) = universe_app::console::serve(&console_handle, stdin.lock(), io::stdout()) {
                    warn!(error = %err, "console stopped");
                }
            });
        if let Err(err) = spawned {
            warn!(error = %err, "failed to start console thread");
        }
    }

    let summary = scheduler.run();
    info!(
        ticks = summary.ticks_run,
        failed = summary.failed_ticks,
        last_tick = summary.last_tick.0,
        "run finished"
    );
    if let Some(snapshot) = handle.latest_snapshot() {
        match serde_json::to_string(&snapshot) {
            Ok(json) => println!("{json}"),
            Err(err) => warn!(error = %err, "failed to encode final snapshot"),
        }
    }
}
