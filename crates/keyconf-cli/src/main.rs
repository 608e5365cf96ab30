//! `keyconf` - headless front end for the KeyConf device link.
//!
//! ```text
//! keyconf ports                      list serial ports
//! keyconf monitor [--emulate]        auto-connect and print every event
//! keyconf send mode_run [--emulate]  connect, send one command, print replies
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

use keyconf_core::emulator::EmulatorHandle;
use keyconf_core::protocol::{
    list_ports, Command, ConnectionConfig, ConnectionManager, LinkEvent, Pins, SerialTransport,
    SystemPortLister,
};
use keyconf_core::runtime::{spawn_link, wait_for_connection, LinkHandle};

/// Port name the virtual controller answers on
const EMULATED_PORT: &str = "keyconf-virtual";

#[derive(Debug, Parser)]
#[command(name = "keyconf", about = "KeyConf keyboard controller link", version)]
struct Cli {
    /// Connection settings (JSON). Defaults to the user config file if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// List serial ports, marking auto-connect candidates
    Ports {
        #[arg(long)]
        json: bool,
    },
    /// Auto-connect and print events until Ctrl+C
    Monitor {
        /// Talk to the built-in virtual controller instead of hardware
        #[arg(long)]
        emulate: bool,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Connect, send one command and print what comes back
    Send {
        /// Command name, e.g. `echo`, `mode_run`, `button_pressed`
        command: Command,
        /// Pin pair as `P1,P2`
        #[arg(long, value_parser = parse_pins)]
        pins: Option<Pins>,
        #[arg(long)]
        emulate: bool,
        /// How long to wait for a connection, in seconds
        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,
        /// How long to keep printing events after sending, in milliseconds
        #[arg(long, default_value_t = 500)]
        wait_ms: u64,
    },
}

fn parse_pins(value: &str) -> Result<Pins, String> {
    let (pin1, pin2) = value
        .split_once(',')
        .ok_or_else(|| format!("expected P1,P2, got '{}'", value))?;
    let pin1 = pin1
        .trim()
        .parse::<u8>()
        .map_err(|e| format!("invalid pin '{}': {}", pin1, e))?;
    let pin2 = pin2
        .trim()
        .parse::<u8>()
        .map_err(|e| format!("invalid pin '{}': {}", pin2, e))?;
    Ok(Pins::new(pin1, pin2))
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ConnectionConfig> {
    if let Some(path) = path {
        return ConnectionConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()));
    }
    match ConnectionConfig::default_config_path() {
        Some(path) if path.exists() => ConnectionConfig::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        _ => Ok(ConnectionConfig::default()),
    }
}

type Link = (LinkHandle, UnboundedReceiver<LinkEvent>, JoinHandle<()>);

fn start_link(mut config: ConnectionConfig, emulate: bool) -> Link {
    if emulate {
        info!("Using virtual controller on {}", EMULATED_PORT);
        let emulator = EmulatorHandle::new(EMULATED_PORT);
        config.test_port = Some(EMULATED_PORT.to_string());
        spawn_link(ConnectionManager::new(
            emulator.transport(),
            emulator.lister(),
            config,
        ))
    } else {
        let transport = SerialTransport::new(config.baud_rate);
        spawn_link(ConnectionManager::new(transport, SystemPortLister, config))
    }
}

fn print_event(event: &LinkEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        println!("{}", event);
    }
    Ok(())
}

fn cmd_ports(config: &ConnectionConfig, json: bool) -> anyhow::Result<()> {
    let ports = list_ports();
    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in &ports {
        let marker = if config.is_candidate(&port.name) { "*" } else { " " };
        match &port.product {
            Some(product) => println!("{} {} ({})", marker, port.name, product),
            None => println!("{} {}", marker, port.name),
        }
    }
    Ok(())
}

async fn cmd_monitor(config: ConnectionConfig, emulate: bool, json: bool) -> anyhow::Result<()> {
    let (link, mut events, task) = start_link(config, emulate);
    link.start_auto_connect().await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event, json)?,
                None => break,
            },
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl+C")?;
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    link.shutdown().await.ok();
    task.await.context("link task panicked")?;
    Ok(())
}

async fn cmd_send(
    config: ConnectionConfig,
    command: Command,
    pins: Option<Pins>,
    emulate: bool,
    connect_timeout: Duration,
    wait: Duration,
) -> anyhow::Result<()> {
    if command.carries_pins() && pins.is_none() {
        bail!("{} needs --pins P1,P2", command);
    }

    let (link, mut events, task) = start_link(config, emulate);
    link.start_auto_connect().await?;
    let port = wait_for_connection(&mut events, connect_timeout)
        .await
        .context("controller not found")?;
    println!("connected on {}", port);

    link.send_command(command, pins).await?;
    let deadline = tokio::time::Instant::now() + wait;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        print_event(&event, false)?;
    }

    link.shutdown().await.ok();
    task.await.context("link task panicked")?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_ref())?;
    config.validate().context("invalid configuration")?;

    match cli.command {
        CliCommand::Ports { json } => cmd_ports(&config, json),
        CliCommand::Monitor { emulate, json } => cmd_monitor(config, emulate, json).await,
        CliCommand::Send {
            command,
            pins,
            emulate,
            connect_timeout,
            wait_ms,
        } => {
            cmd_send(
                config,
                command,
                pins,
                emulate,
                Duration::from_secs(connect_timeout),
                Duration::from_millis(wait_ms),
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pins() {
        assert_eq!(parse_pins("3,5"), Ok(Pins::new(3, 5)));
        assert_eq!(parse_pins(" 1 , 15 "), Ok(Pins::new(1, 15)));
        assert!(parse_pins("3").is_err());
        assert!(parse_pins("3,300").is_err());
    }

    #[test]
    fn test_send_arguments() {
        let cli = Cli::parse_from([
            "keyconf",
            "send",
            "ModeDiodeConfig",
            "--pins",
            "3,5",
            "--emulate",
            "-v",
        ]);
        assert_eq!(cli.verbose, 1);
        match cli.command {
            CliCommand::Send {
                command,
                pins,
                emulate,
                wait_ms,
                ..
            } => {
                assert_eq!(command, Command::ModeDiodeConfig);
                assert_eq!(pins, Some(Pins::new(3, 5)));
                assert!(emulate);
                assert_eq!(wait_ms, 500);
            }
            other => panic!("unexpected subcommand {:?}", other),
        }
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Cli::try_parse_from(["keyconf", "send", "reboot"]).is_err());
    }

    #[tokio::test]
    async fn test_send_against_emulator() {
        let result = cmd_send(
            ConnectionConfig::default(),
            Command::ButtonPressed,
            Some(Pins::new(2, 3)),
            true,
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .await;
        assert!(result.is_ok());
    }
}
