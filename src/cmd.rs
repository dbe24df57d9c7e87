use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};
use log::{debug, error, info};
use tokio::runtime::Builder;

use crate::aws::imds::MetadataClient;
use crate::backoff::{Clock, SystemClock};
use crate::config::Config;
use crate::interface::{MacAddr, validate_name};
use crate::link::{LinkOps, NetlinkLinks};
use crate::logger::{init_logger, set_debug};
use crate::reload::{Networkctl, ReloadCoordinator};
use crate::setup::{InterfaceSetup, remove_interface};

/// Configure systemd-networkd for an EC2 network interface.
#[derive(Debug, Parser)]
#[command(name = "netcfg", version)]
pub struct Cli {
    /// JSON configuration file.
    #[arg(long, env = "NETCFG_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, PartialEq, Subcommand)]
enum Action {
    /// Configure an interface that just appeared, waiting for metadata to
    /// catch up.
    Start(Target),
    /// Regenerate configuration for an interface that is already set up.
    Refresh(Target),
    /// Remove configuration for an interface that went away.
    Remove(RemoveTarget),
}

#[derive(Debug, PartialEq, Args)]
struct Target {
    iface: String,

    /// MAC address of the interface. Read from the link when omitted.
    #[arg(long)]
    mac: Option<MacAddr>,
}

#[derive(Debug, PartialEq, Args)]
struct RemoveTarget {
    iface: String,
}

impl Action {
    fn iface(&self) -> &str {
        match self {
            Self::Start(t) | Self::Refresh(t) => &t.iface,
            Self::Remove(t) => &t.iface,
        }
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.debug).map_err(|e| anyhow!("unable to initialize logger: {}", e))?;

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if config.debug {
        set_debug(true);
    }
    debug!("Configuration: {:?}", config);

    let iface = cli.action.iface();
    validate_name(iface)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let coordinator = ReloadCoordinator::new(&config, clock.clone(), Arc::new(Networkctl));
    let guard = match coordinator.register(iface) {
        Ok(guard) => {
            guard.exit_on_signals()?;
            Some(guard)
        }
        Err(e) => {
            error!("Proceeding without reload registration: {}", e);
            None
        }
    };

    let changes = execute(&cli.action, &config, clock)?;
    if changes > 0 {
        info!("{} configuration change(s) for {}", changes, iface);
        coordinator.mark_reload_needed()?;
    }

    if let Some(guard) = guard {
        guard.release()?;
    }
    Ok(())
}

fn execute(action: &Action, config: &Config, clock: Arc<dyn Clock>) -> Result<u32> {
    let (target, initial_setup) = match action {
        Action::Remove(t) => return remove_interface(config, &t.iface),
        Action::Start(t) => (t, true),
        Action::Refresh(t) => (t, false),
    };

    let rt = Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("unable to create async runtime: {}", e))?;

    let links = NetlinkLinks::new(rt.handle().clone())?;
    let mac = match target.mac {
        Some(mac) => mac,
        None => links.mac(&target.iface)?,
    };
    debug!("Interface {} has MAC {}", target.iface, mac);

    let metadata = MetadataClient::new(rt.handle().clone(), config, clock.clone())?;
    // Fetches retry the token lazily, so failing here is not fatal.
    metadata.acquire_token(initial_setup);

    let setup = InterfaceSetup::new(config, &metadata, &links, clock.as_ref());
    Ok(setup.setup(&target.iface, mac, initial_setup))
}
