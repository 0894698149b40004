//! Binary entrypoint for the meshagent CLI.
//!
//! Commands:
//! - `init` - write a starter `meshagent.toml`
//! - `check` - load and validate the configuration and print a summary
//! - `simulate [--secs <n>]` - run the agent against the loopback radio,
//!   exercising notifications, a reminder and a telemetry watcher, then print
//!   a JSON metrics snapshot
//!
//! See the library crate docs for module-level details: `meshagent::`.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};

use meshagent::agent::MeshAgent;
use meshagent::config::Config;
use meshagent::health::ProcessExit;
use meshagent::metrics;
use meshagent::scheduler::{Comparator, TaskTrigger};
use meshagent::transport::loopback::LoopbackRadio;
use meshagent::transport::{Destination, NodeId};

#[derive(Parser)]
#[command(name = "meshagent")]
#[command(about = "Reliable delivery and proactive scheduling for a Meshtastic AI agent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "meshagent.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Validate the configuration file
    Check,
    /// Run the agent against an in-process loopback radio
    Simulate {
        /// How long to let the simulation run, in seconds
        #[arg(short, long, default_value_t = 40)]
        secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    if !matches!(cli.command, Commands::Init) {
        init_logging(&pre_config, cli.verbose);
    }

    match cli.command {
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            println!("Created default configuration at {}", cli.config);
        }
        Commands::Check => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            if let Err(e) = config.validate() {
                eprintln!("Configuration invalid: {}", e);
                std::process::exit(2);
            }
            let d = &config.delivery;
            let h = &config.health;
            println!("{} ({})", config.agent.name, config.local_node()?);
            println!(
                "  delivery: {}B chunks, pacing {}ms/{}ms, ack timeout {}s, {} retries, queue {}",
                d.max_chunk_bytes,
                d.direct_pacing_ms,
                d.broadcast_pacing_ms,
                d.ack_timeout_secs,
                d.max_retries,
                d.max_queue
            );
            println!(
                "  health: silent after {}s, probe timeout {}s, liveness {}",
                h.activity_timeout_secs,
                h.probe_timeout_secs,
                h.liveness_file.as_deref().unwrap_or("disabled")
            );
            println!(
                "  scheduler: {} tasks/owner, watchers {}",
                config.scheduler.max_tasks_per_owner,
                if config.scheduler.rearm_condition_watches {
                    "re-arm"
                } else {
                    "fire once"
                }
            );
        }
        Commands::Simulate { secs } => {
            let mut config = pre_config.unwrap_or_default();
            // never touch a real supervisor's heartbeat from a simulation
            config.health.liveness_file = None;
            simulate(config, Duration::from_secs(secs)).await?;
        }
    }

    Ok(())
}

async fn simulate(config: Config, run_for: Duration) -> Result<()> {
    let local = config.local_node()?;
    let peer = NodeId(local.0.wrapping_add(0x100));
    let channel = config.agent.primary_channel;

    let (radio, events) = LoopbackRadio::new(local);
    radio.set_self_echo(true);
    let agent = MeshAgent::new(config, Arc::new(radio.clone()), Arc::new(ProcessExit::default()))?;
    let handle = agent.start(events);
    radio.attach();

    let briefing = "Good morning mesh. Solar input is nominal and the ridge relay reports full battery. \
        Expect light rain after noon; the valley repeater may drop out while the generator is serviced. \
        Reply with !ai followed by a question to reach the assistant.";
    for result in agent
        .pipeline()
        .send_notification(&[Destination::Node(peer), Destination::Channel(channel)], briefing)
    {
        if let Err(e) = result {
            warn!("Briefing not queued: {}", e);
        }
    }

    let scheduler = agent.scheduler();
    let reminder = scheduler.register_task(
        TaskTrigger::At(scheduler.now() + chrono::Duration::seconds(5)),
        vec![Destination::Node(peer)],
        "Reminder {id}: check the antenna mast",
        peer,
    )?;
    let watch = scheduler.register_task(
        TaskTrigger::Threshold {
            node: peer,
            metric: "battery".to_string(),
            op: Comparator::Lt,
            threshold: 20.0,
        },
        vec![Destination::Node(peer)],
        "{node} battery at {value}% (below {threshold}%)",
        peer,
    )?;
    info!("Simulation registered {} and {}", reminder, watch);

    for level in [42.0, 31.0, 18.0, 12.0] {
        radio.inject_telemetry(peer, "battery", level);
    }

    tokio::time::sleep(run_for).await;
    handle.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&metrics::snapshot())?);
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    match file {
        Some(f) => {
            let file = std::sync::Mutex::new(f);
            // Foreground runs also echo to the console; under a supervisor stdout is not a TTY.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = file.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                writeln!(
                    fmt,
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                )
            });
        }
    }
    let _ = builder.try_init();
}
