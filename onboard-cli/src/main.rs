//! onboard - provision headless devices from the command line
//!
//! Usage:
//!   ONBOARD_HOME=/tmp/onboard cargo run -p onboard-cli -- <command>
//!
//! Commands:
//!   scan [--duration SECS] [--prefix NAME]
//!   provision [--device ID] --ssid SSID --password PASS [--owner UID]
//!   register --device-id ID [--owner UID] [--name NAME]
//!   devices [--owner UID] [--watch]
//!   config

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use futures::StreamExt;
use onboard::{
    Attributes, DiscoveredDevice, FlowOutcome, HttpHandoff, Orchestrator, ProvisionConfig,
    ProvisionError, Registry, ScanOutcome, Transport, onboard_home, projector, registry,
};
use onboard_ble::BleTransport;

#[derive(Parser)]
#[command(name = "onboard")]
#[command(about = "Provision headless devices over BLE and bind them to an owner")]
struct Cli {
    /// Debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for devices waiting to be provisioned
    Scan {
        /// Scan duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,
        /// Advertised name prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Send WiFi credentials to a device and register it
    Provision {
        /// Device identifier or name to provision, the first one found if omitted
        #[arg(short, long)]
        device: Option<String>,
        /// WiFi SSID
        #[arg(long)]
        ssid: String,
        /// WiFi password
        #[arg(long)]
        password: String,
        /// Owner identity the device is bound to
        #[arg(long)]
        owner: Option<String>,
    },
    /// Bind an already provisioned device to an owner
    Register {
        #[arg(long)]
        device_id: String,
        #[arg(long)]
        owner: Option<String>,
        /// Display name stored with the device
        #[arg(long)]
        name: Option<String>,
    },
    /// List the devices bound to an owner
    Devices {
        #[arg(long)]
        owner: Option<String>,
        /// Keep printing the list as it changes
        #[arg(short, long)]
        watch: bool,
    },
    /// Print the effective configuration
    Config,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let home = onboard_home()?;
    let mut config = ProvisionConfig::load_or_create(&home)?;
    tracing::debug!(home = %home.display(), registry = ?config.masked().registry, "config loaded");

    match cli.command {
        Commands::Scan { duration, prefix } => {
            if let Some(duration) = duration {
                config.scan_secs = duration;
            }
            if let Some(prefix) = prefix {
                config.scan_prefix = prefix;
            }
            cmd_scan(&config).await?
        }
        Commands::Provision { device, ssid, password, owner } => {
            let owner = resolve_owner(owner, &config)?;
            cmd_provision(&config, &owner, device.as_deref(), &ssid, &password).await?
        }
        Commands::Register { device_id, owner, name } => {
            let owner = resolve_owner(owner, &config)?;
            cmd_register(&config, &owner, &device_id, name).await?
        }
        Commands::Devices { owner, watch } => {
            let owner = resolve_owner(owner, &config)?;
            cmd_devices(&config, &owner, watch).await?
        }
        Commands::Config => {
            println!("# {}", home.join("config.json").display());
            println!("{}", serde_json::to_string_pretty(&config.masked())?);
        }
    }

    Ok(())
}

fn resolve_owner(
    flag: Option<String>,
    config: &ProvisionConfig,
) -> Result<String, Box<dyn std::error::Error>> {
    flag.or_else(|| config.owner.clone())
        .filter(|o| !o.trim().is_empty())
        .ok_or_else(|| "no owner given: pass --owner or set \"owner\" in config.json".into())
}

fn print_device(device: &DiscoveredDevice) {
    let rssi = device.rssi.map(|r| format!(" ({r}dBm)")).unwrap_or_default();
    println!("  {} - {}{}", device.label(), device.identifier, rssi);
}

/// Exact identifier first, then a name or identifier containing `target`
fn pick<'a>(devices: &'a [DiscoveredDevice], target: Option<&str>) -> Option<&'a DiscoveredDevice> {
    let Some(target) = target else { return devices.first() };
    devices.iter().find(|d| d.identifier == target).or_else(|| {
        devices.iter().find(|d| {
            d.identifier.contains(target)
                || d.display_name.as_deref().is_some_and(|n| n.contains(target))
        })
    })
}

async fn cmd_scan(config: &ProvisionConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for devices ({} seconds)...", config.scan_secs);

    let transport = BleTransport::new().await?;
    let devices = transport.discover(&config.flow_settings().filter).await?;

    if devices.is_empty() {
        println!("\nNo devices found.");
        println!("Make sure your device is powered on and in provisioning mode.");
        return Ok(());
    }

    println!("\nDevices:");
    for device in &devices {
        print_device(device);
    }
    Ok(())
}

async fn cmd_provision(
    config: &ProvisionConfig,
    owner: &str,
    target: Option<&str>,
    ssid: &str,
    password: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let transport = Arc::new(BleTransport::new().await?);
    let orchestrator = Arc::new(Orchestrator::new(
        transport,
        Arc::new(HttpHandoff::new(config.handoff_timeout())),
        registry::from_config(&config.registry),
        owner,
        config.flow_settings(),
    ));

    let mut states = orchestrator.watch_state();
    let printer = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            println!("  -> {state}");
        }
    });

    let o = orchestrator.clone();
    let interrupt = tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            match o.cancel() {
                Ok(()) => println!("Cancelling..."),
                Err(e) => println!("Cannot cancel now: {e}"),
            }
        }
    });

    let result = provision(&orchestrator, owner, target, ssid, password).await;
    interrupt.abort();
    printer.abort();
    result
}

async fn provision(
    orchestrator: &Arc<Orchestrator<BleTransport>>,
    owner: &str,
    target: Option<&str>,
    ssid: &str,
    password: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for devices...");
    let devices = match orchestrator.start_scan().await? {
        ScanOutcome::Devices(devices) => devices,
        ScanOutcome::NoDevices => {
            println!("No devices found.");
            return Ok(());
        }
        ScanOutcome::Cancelled => {
            println!("Cancelled.");
            return Ok(());
        }
    };

    let Some(device) = pick(&devices, target) else {
        println!("No device matching {:?}. Found:", target.unwrap_or_default());
        for device in &devices {
            print_device(device);
        }
        return Ok(());
    };
    orchestrator.select_device(&device.identifier)?;

    println!("Provisioning {} with WiFi credentials...", device.label());
    println!("  SSID: {ssid}");

    match orchestrator.submit_credentials(ssid, password).await {
        Ok(FlowOutcome::Completed(registered)) => {
            println!("Device {} registered to {owner}.", registered.id);
            Ok(())
        }
        Ok(FlowOutcome::Cancelled) => {
            println!("Cancelled.");
            Ok(())
        }
        Err(e) => match e.resumable_device().map(str::to_string) {
            Some(id) => offer_retry(orchestrator, id, e).await,
            None => Err(e.into()),
        },
    }
}

/// The device is already on the network; only the registry write failed
async fn offer_retry(
    orchestrator: &Arc<Orchestrator<BleTransport>>,
    device_id: String,
    mut error: ProvisionError,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        println!("{error}");
        println!("Retry registration of {device_id}? [y/N]");
        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await??;

        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("Later: onboard register --device-id {device_id} --owner {}", orchestrator.owner());
            return Err(error.into());
        }

        match orchestrator.retry_registration(&device_id).await {
            Ok(registered) => {
                println!("Device {} registered to {}.", registered.id, orchestrator.owner());
                return Ok(());
            }
            Err(e) => error = e,
        }
    }
}

async fn cmd_register(
    config: &ProvisionConfig,
    owner: &str,
    device_id: &str,
    name: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = registry::from_config(&config.registry);

    let mut attributes = Attributes::new();
    if let Some(name) = name {
        attributes.insert("name".into(), name.into());
    }
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    attributes.insert("registeredAt".into(), now.into());

    let registered = registry.register(owner, device_id, attributes).await?;
    println!("Device {} registered to {owner}.", registered.id);
    Ok(())
}

async fn cmd_devices(
    config: &ProvisionConfig,
    owner: &str,
    watch: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = registry::from_config(&config.registry);
    let mut views = projector::watch(registry.as_ref(), owner).await?;

    if !watch {
        if let Some(view) = views.next().await {
            print!("{}", view?);
        }
        return Ok(());
    }

    println!("Watching devices of {owner} (Ctrl-C to stop)");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            view = views.next() => match view {
                Some(view) => {
                    println!("--- {} device(s)", view.as_ref().map(|v| v.rows.len()).unwrap_or(0));
                    print!("{}", view?);
                }
                None => return Ok(()),
            },
        }
    }
}
