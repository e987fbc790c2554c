use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use wifi_manager::{
    CredentialStore, Security, Settings, SystemExecutor, WifiManager,
    config, display, interface, server,
};

#[derive(Parser)]
#[command(name = "wifi-manager")]
#[command(about = "Scan, connect and diagnose Wi-Fi through NetworkManager or wpa_supplicant")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.config/wifi-manager/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// WiFi interface to manage (overrides the config file)
    #[arg(short, long, global = true)]
    interface: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List WiFi interfaces
    Interfaces,

    /// Scan for WiFi networks
    Scan,

    /// Show the current connection
    Current,

    /// List saved networks
    Saved,

    /// Connect to a WiFi network
    Connect {
        /// SSID of the network to connect to
        ssid: String,

        /// Passphrase; prompted for when the network needs one and none is saved
        #[arg(short, long)]
        password: Option<String>,

        /// Security type (Open, WPA, WPA2, WPA3); looked up by scanning when omitted
        #[arg(short, long)]
        security: Option<Security>,
    },

    /// Save a network for later without connecting to it
    Save {
        /// SSID of the network to save
        ssid: String,

        /// Passphrase; prompted for when the network needs one
        #[arg(short, long)]
        password: Option<String>,

        /// Security type (Open, WPA, WPA2, WPA3); looked up by scanning when omitted
        #[arg(short, long)]
        security: Option<Security>,
    },

    /// Forget a saved network
    Forget {
        /// SSID of the network to forget
        ssid: String,
    },

    /// Set or clear the friendly label of a saved network
    Label {
        /// SSID of the saved network
        ssid: String,

        /// New label; omit to clear it
        label: Option<String>,
    },

    /// Run connectivity, DNS and latency checks
    Diagnostics,

    /// Ping a host
    Ping {
        /// Host to ping (defaults to the configured ping target)
        target: Option<String>,

        /// Number of echo requests (1-10)
        #[arg(short = 'n', long)]
        count: Option<u32>,
    },

    /// Serve the JSON web API
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so tables on stdout stay pipeable.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wifi_manager=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if cli.interface.is_some() {
        settings.interface = cli.interface;
    }

    match cli.command {
        Commands::Interfaces => cmd_interfaces(&settings).await,
        Commands::ShowConfig => cmd_show_config(&settings, cli.config),
        Commands::Serve { port, bind } => {
            if let Some(port) = port {
                settings.web.port = port;
            }
            if let Some(bind) = bind {
                settings.web.bind = bind;
            }
            let manager = start_manager(settings).await?;
            server::run_server(Arc::new(manager)).await
        }
        command => {
            let manager = start_manager(settings).await?;
            run_command(&manager, command).await
        }
    }
}

async fn start_manager(settings: Settings) -> Result<WifiManager> {
    let store_path = settings.store_path()?;
    let store = CredentialStore::open(&store_path)
        .with_context(|| format!("Failed to open saved networks at {}", store_path.display()))?;
    Ok(WifiManager::start(Arc::new(SystemExecutor), store, settings).await)
}

async fn run_command(manager: &WifiManager, command: Commands) -> Result<()> {
    match command {
        Commands::Scan => cmd_scan(manager).await,
        Commands::Current => cmd_current(manager).await,
        Commands::Saved => cmd_saved(manager).await,
        Commands::Connect {
            ssid,
            password,
            security,
        } => cmd_connect(manager, &ssid, password, security).await,
        Commands::Save {
            ssid,
            password,
            security,
        } => cmd_save(manager, &ssid, password, security).await,
        Commands::Forget { ssid } => cmd_forget(manager, &ssid).await,
        Commands::Label { ssid, label } => cmd_label(manager, &ssid, label).await,
        Commands::Diagnostics => cmd_diagnostics(manager).await,
        Commands::Ping { target, count } => cmd_ping(manager, target.as_deref(), count).await,
        Commands::Interfaces | Commands::Serve { .. } | Commands::ShowConfig => Ok(()),
    }
}

async fn cmd_interfaces(settings: &Settings) -> Result<()> {
    let exec = SystemExecutor;
    let interfaces = match interface::list_wifi_interfaces(&exec, settings.command_timeout()).await {
        Ok(interfaces) => interfaces,
        Err(e) => {
            tracing::debug!(error = %e, "NetworkManager device list unavailable, using sysfs");
            interface::sysfs_wireless_interfaces()
                .into_iter()
                .map(|name| interface::WifiInterface {
                    name,
                    state: "unmanaged".to_string(),
                })
                .collect()
        }
    };

    display::display_interfaces(&interfaces);
    Ok(())
}

async fn cmd_scan(manager: &WifiManager) -> Result<()> {
    println!("Scanning...");
    println!();

    let networks = manager.scan().await?;
    display::display_networks(&networks);

    Ok(())
}

async fn cmd_current(manager: &WifiManager) -> Result<()> {
    let current = manager.current().await?;
    display::display_current(&current, &manager.state());
    Ok(())
}

async fn cmd_saved(manager: &WifiManager) -> Result<()> {
    let saved = manager.list_saved().await?;
    display::display_saved(&saved);
    Ok(())
}

async fn cmd_connect(
    manager: &WifiManager,
    ssid: &str,
    password: Option<String>,
    security: Option<Security>,
) -> Result<()> {
    let security = match security {
        Some(security) => security,
        None => lookup_security(manager, ssid).await,
    };

    let password = match password {
        Some(p) => Some(p),
        None if manager.needs_secret(ssid, security) => {
            let prompt = format!("Password for '{ssid}': ");
            let entered = rpassword::prompt_password(prompt).context("Failed to read password")?;
            if entered.is_empty() {
                bail!("A password is required for '{ssid}'");
            }
            Some(entered)
        }
        None => None,
    };

    println!("Connecting to '{ssid}'...");
    let report = manager.connect(ssid, password.as_deref(), security).await?;
    if let Some(reason) = report.reason {
        return Err(reason.into_error(ssid).into());
    }
    println!("{}", report.message);

    // Show status after connecting
    println!();
    if let Some(current) = &report.connection {
        display::display_current(current, &manager.state());
    }

    Ok(())
}

/// Security for `ssid` from the saved list, then a fresh scan, else WPA2.
async fn lookup_security(manager: &WifiManager, ssid: &str) -> Security {
    if let Ok(saved) = manager.list_saved().await {
        if let Some(entry) = saved.iter().find(|n| n.ssid == ssid && n.security.is_known()) {
            return entry.security;
        }
    }

    match manager.scan().await {
        Ok(networks) => networks
            .into_iter()
            .find(|n| n.ssid == ssid && n.security.is_known())
            .map(|n| n.security)
            .unwrap_or(Security::Wpa2),
        Err(e) => {
            tracing::debug!(error = %e, "Scan for security type failed");
            Security::Wpa2
        }
    }
}

async fn cmd_save(
    manager: &WifiManager,
    ssid: &str,
    password: Option<String>,
    security: Option<Security>,
) -> Result<()> {
    let security = match security {
        Some(security) => security,
        None => lookup_security(manager, ssid).await,
    };

    let password = match password {
        Some(p) => Some(p),
        None if !security.is_open() => {
            let entered = rpassword::prompt_password(format!("Password for '{ssid}': "))
                .context("Failed to read password")?;
            Some(entered)
        }
        None => None,
    };

    let report = manager.save_network(ssid, password.as_deref(), security).await?;
    println!("{}", report.message);
    Ok(())
}

async fn cmd_forget(manager: &WifiManager, ssid: &str) -> Result<()> {
    let report = manager.forget(ssid).await?;
    if !report.success {
        bail!(report.message);
    }
    println!("{}", report.message);
    Ok(())
}

async fn cmd_label(manager: &WifiManager, ssid: &str, label: Option<String>) -> Result<()> {
    let report = manager.set_label(ssid, label).await?;
    if !report.success {
        bail!(report.message);
    }
    println!("{}", report.message);
    Ok(())
}

async fn cmd_diagnostics(manager: &WifiManager) -> Result<()> {
    println!("Running diagnostics...");
    println!();

    let report = manager.diagnostics().await;
    display::display_diagnostics(&report);
    Ok(())
}

async fn cmd_ping(manager: &WifiManager, target: Option<&str>, count: Option<u32>) -> Result<()> {
    let result = manager.ping(target, count).await?;
    display::display_ping(&result);
    Ok(())
}

fn cmd_show_config(settings: &Settings, explicit: Option<PathBuf>) -> Result<()> {
    let path = match explicit {
        Some(path) => path,
        None => config::config_path()?,
    };
    println!("Config file: {}", path.display());
    println!("Saved networks: {}", settings.store_path()?.display());
    println!();
    print!("{}", settings.to_toml()?);

    Ok(())
}
