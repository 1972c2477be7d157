mod config;
mod geo_blocker;

use std::{io::Write, process::ExitCode, str::FromStr, sync::Arc, time::Duration};

use chrono::Local;
use clap::{Parser, Subcommand};
use colored::{Color, Colorize};
use config::Config;
use geo_blocker::{
    ConfigSource, FileSource, KernelFilter, MemoryFilter, PacketFilter, Result, Rule, RunStatus,
    Updater,
};
use log::{LevelFilter, debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Enable timestamp in logs (overrides config file setting)
    #[arg(short, long)]
    timestamp: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one update and wait for it to finish
    Update {
        /// Apply to an in-memory packet filter and print the result
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the last completion and the managed kernel state
    Status,
    /// Run an update at every configured interval
    Daemon,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI args
    let cli = Cli::parse();

    // Load configuration
    let mut config = match cli.config.as_deref().map(Config::load).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("Failed to load configuration file: {}", e);
            return ExitCode::from(2);
        }
    };

    // CLI timestamp option overrides config file setting
    config.log.timestamp = cli.timestamp || config.log.timestamp;

    // Initialize logger
    init_logger(
        config.log.timestamp,
        LevelFilter::from_str(&config.log.level).unwrap_or(LevelFilter::Info),
    );
    debug!("LOADED CONFIGURATION: {:?}", &config);

    let result = match cli.command {
        Command::Update { dry_run: false } => update(&config).await,
        Command::Update { dry_run: true } => dry_run(config).await,
        Command::Status => status(&config),
        Command::Daemon => daemon(&config).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn build_updater(config: &Config, filter: Arc<dyn PacketFilter>) -> Result<Updater> {
    Updater::builder()
        .dataset(&config.dataset)
        .network(&config.network)
        .firewall(&config.firewall)
        .snapshot(&config.snapshot)
        .update(&config.updater)
        .filter(filter)
        .source(Arc::new(FileSource::new(
            &config.source.selection,
            &config.source.state,
        )))
        .build()
}

/// Trigger one run and wait for its terminal status
async fn run_once(updater: &Updater) -> Result<bool> {
    let handle = updater.trigger_update()?;
    let Some(status) = updater.wait(handle).await else {
        return Ok(false);
    };
    if let Some(run) = updater.run(handle) {
        let elapsed = run
            .finished_at
            .map(|t| (t - run.started_at).num_milliseconds())
            .unwrap_or_default();
        info!("UPDATE [{}] {} IN [{}ms]", handle, status, elapsed);
    }
    Ok(status == RunStatus::Succeeded)
}

async fn update(config: &Config) -> Result<bool> {
    let filter = Arc::new(KernelFilter::new(&config.firewall)?);
    run_once(&build_updater(config, filter)?).await
}

/// Apply to an in-memory filter, with snapshots, state and lock kept out of the system paths
async fn dry_run(mut config: Config) -> Result<bool> {
    let scratch = std::env::temp_dir().join("geoblock-dry-run");
    config.snapshot.dir = scratch.join("backup");
    config.source.state = scratch.join("state.toml");
    config.updater.lock = scratch.join("geoblock.lock");
    warn!("DRY RUN, SNAPSHOTS AND STATE IN [{}]", scratch.display());

    let filter = Arc::new(MemoryFilter::new());
    let succeeded = run_once(&build_updater(&config, filter.clone())?).await?;

    let mut out = std::io::stdout().lock();
    write!(out, "{}", filter.dump_set(&config.firewall.set_name)?)?;
    write!(out, "{}", filter.dump_rules()?)?;
    Ok(succeeded)
}

fn status(config: &Config) -> Result<bool> {
    let source = FileSource::new(&config.source.selection, &config.source.state);
    match source.last_completion()? {
        Some(t) => println!("Last completion: {}", t.to_rfc3339()),
        None => println!("Last completion: never"),
    }

    let filter = KernelFilter::new(&config.firewall)?;
    let set = &config.firewall.set_name;
    if filter.set_exists(set)? {
        let members = filter
            .dump_set(set)?
            .lines()
            .filter(|line| line.starts_with("add "))
            .count();
        println!("Set {}: {} blocks", set, members);
    } else {
        println!("Set {}: absent", set);
    }

    println!("Managed rules in {}:", config.firewall.chain);
    for rule in filter
        .list_rules(&config.firewall.chain)?
        .iter()
        .filter(|rule| Rule::is_managed(rule))
    {
        println!("  {}", rule);
    }
    Ok(true)
}

async fn daemon(config: &Config) -> Result<bool> {
    let filter = Arc::new(KernelFilter::new(&config.firewall)?);
    let updater = build_updater(config, filter)?;
    let interval = Duration::from_secs(config.updater.interval);

    loop {
        // A failed run is retried at the next interval
        if let Err(e) = run_once(&updater).await {
            error!("UPDATE NOT STARTED: {}", e);
        }
        info!("NEXT UPDATE IN [{}s]", interval.as_secs());
        tokio::time::sleep(interval).await;
    }
}

/// Custom logger initialization, with optional timestamp
fn init_logger(timestamp: bool, level: LevelFilter) {
    env_logger::Builder::new()
        .format(move |buf, record| {
            let color = match record.level() {
                log::Level::Error => Color::Red,
                log::Level::Warn => Color::Yellow,
                log::Level::Info => Color::Green,
                log::Level::Debug => Color::Blue,
                log::Level::Trace => Color::Magenta,
            };
            let level = format!("{:5}", record.level()).color(color);
            if timestamp {
                writeln!(
                    buf,
                    "[{} {}] {}",
                    Local::now().format("%Y-%m-%d %H:%M:%S"),
                    level,
                    record.args()
                )
            } else {
                writeln!(buf, "[{}] {}", level, record.args())
            }
        })
        .filter_module("geoblock", level)
        .init();
}
