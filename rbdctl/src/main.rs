//! `rbdctl` — attach and detach RBD volumes on this host.
//!
//! `attach` prints the attach record as JSON; keep it and hand it back to
//! `detach` unchanged.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use librbd::monitor::{CephCliMonitors, MonitorAddrs, MonitorSource, StaticMonitors};
use librbd::privileged::{CommandRunner, ProcessRunner};
use librbd::{
    AttachOrchestrator, AttachRecord, ConnectorRegistry, DetachOrchestrator, DriverConfig,
    VolumeRef, build_descriptor,
};

#[derive(Parser, Debug)]
#[command(name = "rbdctl", version, about = "Attach and detach RBD volumes")]
struct Cli {
    /// YAML configuration file with `rbd:` and `host:` sections.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the connection descriptor for a volume.
    ConnectionInfo(VolumeArgs),
    /// Attach a volume and print the attach record.
    Attach {
        #[command(flatten)]
        volume: VolumeArgs,
        /// Write the record here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Detach a volume using a record produced by `attach`.
    Detach {
        #[arg(long)]
        record: PathBuf,
        #[arg(long)]
        force: bool,
        /// The device was attached on another host; skip the local disconnect.
        #[arg(long)]
        remote: bool,
    },
}

#[derive(Args, Debug)]
struct VolumeArgs {
    #[arg(long)]
    volume_id: String,
    /// Image name; defaults to `volume-<volume id>`.
    #[arg(long)]
    volume_name: Option<String>,
    #[arg(long)]
    encryption_key_id: Option<String>,
    /// Monitor endpoint `host:port`; repeat for several.  Queried from the
    /// cluster when omitted.
    #[arg(long = "mon")]
    mons: Vec<String>,
}

impl VolumeArgs {
    fn volume(&self) -> VolumeRef {
        let name = self
            .volume_name
            .clone()
            .unwrap_or_else(|| format!("volume-{}", self.volume_id));
        let volume = VolumeRef::new(self.volume_id.as_str(), name);
        match &self.encryption_key_id {
            Some(key) => volume.with_encryption_key(key.as_str()),
            None => volume,
        }
    }

    fn static_monitors(&self) -> Result<Option<MonitorAddrs>> {
        if self.mons.is_empty() {
            return Ok(None);
        }
        let mut addrs = MonitorAddrs::default();
        for mon in &self.mons {
            let Some((host, port)) = mon.rsplit_once(':') else {
                bail!("monitor {mon:?} is not host:port");
            };
            addrs
                .hosts
                .push(host.trim_start_matches('[').trim_end_matches(']').to_owned());
            addrs.ports.push(port.to_owned());
        }
        Ok(Some(addrs))
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn load_config(path: Option<&PathBuf>) -> Result<DriverConfig> {
    let mut config = match path {
        Some(path) => DriverConfig::load(path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => DriverConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("invalid RBD_* environment override")?;
    Ok(config)
}

async fn descriptor_for(
    config: &DriverConfig,
    runner: Arc<dyn CommandRunner>,
    args: &VolumeArgs,
) -> Result<librbd::ConnectionDescriptor> {
    let monitors: Box<dyn MonitorSource> = match args.static_monitors()? {
        Some(addrs) => Box::new(StaticMonitors(addrs)),
        None => Box::new(CephCliMonitors::new(&config.rbd, runner)),
    };
    let addrs = monitors
        .mon_addrs()
        .await
        .context("failed to query monitor addresses")?;
    let volume = args.volume();
    Ok(build_descriptor(
        &config.rbd,
        &addrs,
        &volume,
        volume.has_encryption_key(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = load_config(cli.config.as_ref()).await?;
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::from_config(&config.host));
    let registry = Arc::new(ConnectorRegistry::with_defaults(runner.clone()));

    match cli.command {
        Command::ConnectionInfo(args) => {
            let descriptor = descriptor_for(&config, runner, &args).await?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }
        Command::Attach { volume, output } => {
            let descriptor = descriptor_for(&config, runner.clone(), &volume).await?;
            let attacher = AttachOrchestrator::new(registry, runner, config.host.clone());
            let record = attacher
                .attach(&descriptor)
                .await
                .context("attach failed")?;
            let json = serde_json::to_string_pretty(&record)?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, json)
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!(record = %path.display(), device = %record.device_path.display(), "attach record written");
                }
                None => println!("{json}"),
            }
        }
        Command::Detach {
            record,
            force,
            remote,
        } => {
            let json = tokio::fs::read_to_string(&record)
                .await
                .with_context(|| format!("failed to read {}", record.display()))?;
            let record: AttachRecord =
                serde_json::from_str(&json).context("malformed attach record")?;
            let detacher = DetachOrchestrator::new(registry, runner, config.host.symlink_prefix.clone());
            detacher
                .detach(&record, force, remote)
                .await
                .context("detach failed")?;
        }
    }
    Ok(())
}
