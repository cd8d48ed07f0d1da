use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{debug, error, info, warn};

use talkproxy_lib::{monitor, GlobalConfig, ProcessSupervisor, SettingReader, Subscription};

/// Subscription manager and supervisor for a hysteria proxy core
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding config.yaml, subscription.yaml and generated proxy files
    #[arg(short, long, value_name = "DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Application settings file (ports etc.)
    #[arg(short, long, value_name = "FILE")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a subscription and add it to the catalog
    Subscribe {
        name: String,
        url: String,
        /// Refresh interval in seconds
        #[arg(short, long, default_value = "86400")]
        interval: String,
    },
    /// Re-fetch one subscription, or every due subscription when no name is given
    Sync { name: Option<String> },
    /// Print the catalog as JSON
    List,
    /// Remove a subscription and its proxy files
    Remove { name: String },
    /// Show, set or clear the default subscription
    Default {
        name: Option<String>,
        #[arg(long, conflicts_with = "name")]
        clear: bool,
    },
    /// Run the core against a proxy of the default (or given) subscription
    Run {
        /// Path to the hysteria binary
        #[arg(long, value_name = "FILE", default_value = "hysteria")]
        core: PathBuf,
        #[arg(long)]
        subscription: Option<String>,
        /// Proxy name within the subscription; the first one when omitted
        #[arg(long)]
        proxy: Option<String>,
    },
    /// Print CPU, memory, disk and network usage as JSON
    Status {
        /// Sampling window in milliseconds
        #[arg(long, default_value_t = 1000)]
        sample_ms: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init_from_env(Env::default().default_filter_or("info"));
    let args = Args::parse();

    let reader = match &args.settings {
        Some(path) => match SettingReader::load(path) {
            Ok(reader) => reader,
            Err(e) => {
                error!("failed to load settings: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => SettingReader::default(),
    };

    let mut config = match GlobalConfig::init(&args.config_dir, &reader) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to open {:?}: {}", args.config_dir, e);
            return ExitCode::FAILURE;
        }
    };

    match execute(&mut config, args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(config: &mut GlobalConfig, command: Command) -> talkproxy_lib::Result<()> {
    match command {
        Command::Subscribe {
            name,
            url,
            interval,
        } => {
            let sub = config.add_subscription(&name, &url, &interval).await?;
            println!("{}: {} proxies", sub.name, sub.files.len());
        }
        Command::Sync { name: Some(name) } => config.sync_subscription(&name).await?,
        Command::Sync { name: None } => {
            for (name, outcome) in config.sync_due().await? {
                match outcome {
                    Ok(()) => println!("{}: synced", name),
                    Err(e) => println!("{}: {}", name, e),
                }
            }
        }
        Command::List => {
            let all = config.catalog_mut().get_all()?;
            match serde_json::to_string_pretty(&all) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("failed to serialize catalog: {}", e),
            }
        }
        Command::Remove { name } => {
            let removed = config.remove_subscription(&name)?;
            println!("removed {} ({} files)", removed.name, removed.files.len());
        }
        Command::Default { clear: true, .. } => config.clear_default_subscription()?,
        Command::Default {
            name: Some(name), ..
        } => config.set_default_subscription(&name)?,
        Command::Default { name: None, .. } => match config.get_default_subscription() {
            Some(sub) => println!("{}", sub.name),
            None => println!("(none)"),
        },
        Command::Run {
            core,
            subscription,
            proxy,
        } => {
            let sub = match subscription {
                Some(name) => config.catalog().get(&name).cloned(),
                None => config.get_default_subscription().cloned(),
            };
            let Some(sub) = sub else {
                warn!("no subscription to run; subscribe and set a default first");
                return Ok(());
            };
            run_core(&core, &sub, proxy.as_deref()).await?;
        }
        Command::Status { sample_ms } => {
            let sample = Duration::from_millis(sample_ms);
            match tokio::task::spawn_blocking(move || monitor::snapshot(sample)).await {
                Ok(status) => {
                    if let Some(speed) = status.network {
                        info!("network: {}", speed);
                    }
                    match serde_json::to_string_pretty(&status) {
                        Ok(json) => println!("{}", json),
                        Err(e) => error!("failed to serialize status: {}", e),
                    }
                }
                Err(e) => error!("status task failed: {}", e),
            }
        }
    }
    Ok(())
}

async fn run_core(
    core: &Path,
    sub: &Subscription,
    proxy: Option<&str>,
) -> talkproxy_lib::Result<()> {
    let file = match proxy {
        Some(name) => sub.file(name),
        None => sub.files.first(),
    };
    let Some(file) = file else {
        return Err(talkproxy_lib::Error::NotFound(
            proxy.unwrap_or("<any proxy>").to_string(),
        ));
    };
    info!("running '{}' from subscription '{}'", file.name, sub.name);

    let supervisor = ProcessSupervisor::for_config(core, &file.path);
    supervisor.start()?;

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
            _ = ticker.tick() => {
                // Lines are already mirrored to the log; draining keeps the queue bounded.
                let drained = supervisor.get_logs().count();
                if drained > 0 {
                    debug!("drained {} core log lines", drained);
                }
                if supervisor.has_exited() {
                    warn!("core exited");
                    break;
                }
            }
        }
    }

    if let Err(e) = tokio::task::spawn_blocking(move || supervisor.stop()).await {
        error!("stop task failed: {}", e);
    }
    Ok(())
}
