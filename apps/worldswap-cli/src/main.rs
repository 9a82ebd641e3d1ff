use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use glam::Vec3;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use worldswap_common::{BlockId, BlockPos, EntityKind, EnvironmentId, Region, Transform};
use worldswap_kernel::World;
use worldswap_persist::{Snapshot, SnapshotLibrary, SnapshotSource};
use worldswap_transition::{
    CycleOutcome, EnvironmentChange, EnvironmentConfig, MutationDomain, ObserverError,
    Orchestrator, PreviewManager, RotationScheduler, SpawnPlacer, SwapConfig, TransitionError,
    TransitionEvent, WorldHost,
};

const CONFIG_FILE: &str = "worldswap.yaml";

#[derive(Parser)]
#[command(name = "worldswap-cli", about = "Swap, preview and rotate world environments")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Snapshot library directory
    #[arg(short, long, default_value = "worldswap-library")]
    library: PathBuf,

    /// Config file (defaults to worldswap.yaml inside the library)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write demo snapshots and a config into the library
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
    /// List configured environments and the swap state
    List,
    /// Check that an environment can be swapped to
    Validate { environment: String },
    /// Check every stored snapshot against the integrity manifest
    Verify,
    /// Swap the current environment
    Swap {
        environment: String,
        /// Countdown seconds (defaults to the configured value)
        #[arg(short = 'n', long)]
        countdown: Option<u32>,
    },
    /// Return to the previous environment
    Rollback {
        #[arg(short = 'n', long)]
        countdown: Option<u32>,
    },
    /// Paste an environment temporarily, then revert it
    Preview {
        environment: String,
        /// Preview duration (defaults to the configured value)
        #[arg(short, long)]
        seconds: Option<u64>,
        #[arg(short, long, default_value = "console")]
        requester: String,
    },
    /// Run the rotation scheduler for a number of cycles
    Rotate {
        #[arg(long, default_value = "3")]
        cycles: u32,
        /// Seconds between cycles (defaults to the configured interval)
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.library.join(CONFIG_FILE));

    if let Commands::Init { force } = cli.command {
        return init(&cli.library, &config_path, force);
    }

    let config = SwapConfig::load(&config_path)
        .with_context(|| format!("run `worldswap-cli init` first ({})", config_path.display()))?;
    let library = Arc::new(SnapshotLibrary::open(&cli.library)?);

    match cli.command {
        Commands::Init { .. } => {}
        Commands::List => list(&config, &library)?,
        Commands::Validate { environment } => {
            let id = EnvironmentId::from(environment);
            match config.validate_environment(&id, library.as_ref()) {
                Ok(()) => println!("{id}: valid"),
                Err(e) => bail!("{id}: {e}"),
            }
        }
        Commands::Verify => {
            library.verify_integrity()?;
            println!(
                "Integrity OK: {} snapshots in {}",
                library.meta().snapshot_count,
                library.root().display()
            );
        }
        Commands::Swap {
            environment,
            countdown,
        } => {
            let id = EnvironmentId::from(environment);
            config.validate_environment(&id, library.as_ref())?;
            let session = Session::start(&config, &library)?;
            let done = session
                .orchestrator
                .begin(
                    id,
                    config.origin,
                    countdown.unwrap_or(config.countdown_seconds),
                )
                .await?;
            println!(
                "Now on '{}' (was {}), relocated={}, cleared={}",
                done.environment,
                describe(done.previous.as_ref()),
                done.relocated,
                done.cleared
            );
            println!("World: {}", session.host.take_changes());
            session.save(&library, None)?;
        }
        Commands::Rollback { countdown } => {
            let session = Session::start(&config, &library)?;
            match session
                .orchestrator
                .rollback(config.origin, countdown.unwrap_or(config.countdown_seconds))
                .await
            {
                Ok(done) => println!(
                    "Rolled back to '{}' ({})",
                    done.environment,
                    session.host.take_changes()
                ),
                Err(TransitionError::HistoryEmpty) => println!("Nothing to roll back to"),
                Err(e) => return Err(e.into()),
            }
            session.save(&library, None)?;
        }
        Commands::Preview {
            environment,
            seconds,
            requester,
        } => {
            let id = EnvironmentId::from(environment);
            let session = Session::start(&config, &library)?;
            let before = session.host.world().state_hash();
            let previews = PreviewManager::new(library.clone(), session.orchestrator.domain().clone());
            let duration = seconds.map_or(config.preview_duration(), Duration::from_secs);
            let ticket = previews
                .start_preview(&requester, id, config.origin, duration)
                .await?;
            println!(
                "Previewing '{}' for {}s (session {})",
                ticket.environment,
                duration.as_secs(),
                ticket.session
            );
            tokio::time::sleep_until(ticket.revert_at).await;
            while previews.is_live(&requester).await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let restored = session.host.world().state_hash() == before;
            println!("Preview reverted, world restored: {restored}");
        }
        Commands::Rotate {
            cycles,
            interval_secs,
        } => {
            let session = Session::start(&config, &library)?;
            let scheduler = RotationScheduler::new(
                session.orchestrator.clone(),
                config.rotation_settings(),
                Arc::new(session.host.clone()),
            );
            scheduler.set_cursor(session.cursor);
            let interval = interval_secs.map_or(config.rotation_interval(), Duration::from_secs);
            for cycle in 1..=cycles {
                tokio::time::sleep(interval).await;
                match scheduler.run_cycle().await {
                    CycleOutcome::Rotated(done) => println!(
                        "cycle {cycle}: rotated to '{}' ({})",
                        done.environment,
                        session.host.take_changes()
                    ),
                    CycleOutcome::Suppressed { online, required } => {
                        println!("cycle {cycle}: skipped, {online}/{required} players online")
                    }
                    CycleOutcome::NoSelection => println!("cycle {cycle}: nothing to rotate to"),
                    CycleOutcome::Overlapped(target) => {
                        println!("cycle {cycle}: '{target}' skipped, transition in progress")
                    }
                    CycleOutcome::Failed { target, error } => {
                        println!("cycle {cycle}: '{target}' failed: {error}")
                    }
                }
            }
            session.save(&library, Some(scheduler.cursor()))?;
        }
    }

    Ok(())
}

/// A demo world wired to the library, with session state restored.
struct Session {
    host: WorldHost,
    orchestrator: Orchestrator,
    cursor: i64,
}

impl Session {
    fn start(config: &SwapConfig, library: &Arc<SnapshotLibrary>) -> anyhow::Result<Self> {
        let host = WorldHost::new(demo_world(config));
        // building the demo world is not a change worth reporting
        host.take_changes();
        let domain = MutationDomain::new(host.authority(config.build_limits));
        let orchestrator = Orchestrator::new(
            library.clone(),
            domain,
            Arc::new(host.clone()),
            config.transition_settings(),
        );

        let state = library.load_session()?;
        orchestrator.restore(&state)?;

        orchestrator
            .registry()
            .register(Arc::new(SpawnPlacer::from_config(host.clone(), config)));
        orchestrator.registry().register(Arc::new(
            |change: &EnvironmentChange| -> Result<(), ObserverError> {
                tracing::info!(current = %change.current, previous = ?change.previous, "environment changed");
                Ok(())
            },
        ));

        let mut events = orchestrator.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    TransitionEvent::Relocated {
                        relocated, cleared, ..
                    } => println!("  secured region: {relocated} moved, {cleared} cleared"),
                    TransitionEvent::Countdown { target, remaining } => {
                        println!("  '{target}' in {remaining}...")
                    }
                    TransitionEvent::Failed { target, error } => {
                        println!("  '{target}' failed: {error}")
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            host,
            orchestrator,
            cursor: state.rotation_cursor,
        })
    }

    fn save(&self, library: &SnapshotLibrary, cursor: Option<i64>) -> anyhow::Result<()> {
        let state = self.orchestrator.session(cursor.unwrap_or(self.cursor));
        library.save_session(&state)?;
        Ok(())
    }
}

fn describe(id: Option<&EnvironmentId>) -> String {
    id.map_or_else(|| "nothing".to_string(), |id| format!("'{id}'"))
}

fn list(config: &SwapConfig, library: &SnapshotLibrary) -> anyhow::Result<()> {
    let state = library.load_session()?;
    println!("Environments in {}:", library.root().display());
    for env in &config.environments {
        let marker = if state.current.as_ref() == Some(&env.id) {
            "*"
        } else {
            " "
        };
        let stored = if library.contains(&env.id) {
            "stored"
        } else {
            "missing"
        };
        println!(
            "{marker} {:<12} {stored:<8} spawns={}",
            env.id.as_str(),
            env.spawns.len()
        );
    }
    let history: Vec<&str> = state.history.iter().map(EnvironmentId::as_str).collect();
    println!("History (oldest first): [{}]", history.join(", "));
    println!("Rotation: {:?}, cursor={}", config.rotation.mode, state.rotation_cursor);
    Ok(())
}

fn init(library_dir: &Path, config_path: &Path, force: bool) -> anyhow::Result<()> {
    if config_path.exists() && !force {
        bail!("{} exists; pass --force to overwrite", config_path.display());
    }
    let mut library = SnapshotLibrary::open(library_dir)?;

    let mut config = SwapConfig {
        origin: BlockPos::new(0, 64, 0),
        countdown_seconds: 3,
        ..SwapConfig::default()
    };
    for (i, name) in ["arena1", "arena2", "arena3"].into_iter().enumerate() {
        let id = EnvironmentId::from(name);
        let snapshot = demo_arena(i as u32 + 1);
        library.save(&id, &snapshot)?;
        config.environments.push(EnvironmentConfig {
            id,
            spawns: vec![
                Vec3::new(2.5, 66.0, 2.5),
                Vec3::new(13.5, 66.0, 13.5),
                Vec3::new(2.5, 66.0, 13.5),
            ],
        });
        println!("Stored '{name}' ({} blocks, hash={:#x})", snapshot.blocks.len(), snapshot.hash);
    }
    config.validate()?;
    std::fs::write(config_path, config.to_yaml_string()?)
        .with_context(|| format!("writing {}", config_path.display()))?;
    library.save_session(&Default::default())?;
    println!("Wrote {}", config_path.display());
    Ok(())
}

const ARENA_SIZE: i32 = 16;

/// A 16x8x16 arena: a floor of `floor` blocks and a pillar pattern that
/// differs per floor id.
fn demo_arena(floor: u32) -> Snapshot {
    let region = Region::new(
        BlockPos::ORIGIN,
        BlockPos::new(ARENA_SIZE - 1, 7, ARENA_SIZE - 1),
    );
    let mut scratch = World::new();
    for x in 0..ARENA_SIZE {
        for z in 0..ARENA_SIZE {
            scratch.set_block(BlockPos::new(x, 0, z), Some(BlockId(floor)));
        }
    }
    let spacing = 3 + floor as i32;
    for x in (1..ARENA_SIZE).step_by(spacing as usize) {
        for y in 1..4 {
            scratch.set_block(BlockPos::new(x, y, x), Some(BlockId(100 + floor)));
        }
    }
    Snapshot::capture(&scratch, region)
}

/// Players standing in the arena, one outside it, and some debris.
fn demo_world(config: &SwapConfig) -> World {
    let base = config.origin;
    let at = |x: f32, y: f32, z: f32| {
        Transform::at(Vec3::new(base.x as f32 + x, base.y as f32 + y, base.z as f32 + z))
    };
    let mut world = World::new();
    world.spawn(EntityKind::Player, at(4.5, 1.0, 4.5));
    world.spawn(EntityKind::Player, at(10.5, 1.0, 7.5));
    world.spawn(EntityKind::Player, at(-20.0, 1.0, -20.0));
    world.spawn(EntityKind::Item, at(6.5, 1.0, 6.5));
    world.spawn(EntityKind::Mob, at(12.5, 1.0, 3.5));
    world
}
