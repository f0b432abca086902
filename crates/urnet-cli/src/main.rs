//! URNET CLI — host a hub or act as a one-shot client.

mod cli;
mod ui;

use clap::Parser;
use cli::{Cli, Commands, Target};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};
use urnet_types::config::BusConfig;
use urnet_types::{BusError, BusResult};
use urnet_wire::config::load_config;
use urnet_wire::services::SERVICE_LIST;
use urnet_wire::{connect_ws, Directory, Messager, Node};

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();
    let config = load_config(cli.config.as_deref());

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to start the async runtime: {e}"));
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(run(cli.command, config)) {
        match &e {
            BusError::NoRoute(_) => ui::error_with_fix(
                &e.to_string(),
                "run `urnet services` to see what the hub can route",
            ),
            BusError::Handshake(_) | BusError::Io(_) => ui::error_with_fix(
                &e.to_string(),
                "check that a hub is running and the --pipe/--ws target is right",
            ),
            _ => ui::error(&e.to_string()),
        }
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: BusConfig) -> BusResult<()> {
    match command {
        Commands::Serve { pipe, ws } => serve(config, pipe, ws).await,
        Commands::Call {
            message,
            data,
            trace,
            target,
        } => {
            let bus = connect(&config, &target).await?;
            let payload = parse_data(&data)?;
            let result = if trace {
                bus.call_response(&message, payload).await.and_then(|response| {
                    ui::section("Hops");
                    let hops: Vec<&str> = response.hops().iter().map(|a| a.as_str()).collect();
                    ui::kv("Sequence", &hops.join(" > "));
                    for entry in response.hop_log() {
                        ui::hint(entry);
                    }
                    response.outcome()
                })
            } else {
                bus.call(&message, payload).await
            };
            finish(&bus).await;
            ui::json(&result?);
            Ok(())
        }
        Commands::Send {
            message,
            data,
            target,
        } => {
            let bus = connect(&config, &target).await?;
            let delivery = bus.send(&message, parse_data(&data)?);
            finish(&bus).await;
            let delivery = delivery?;
            let to: Vec<String> = delivery.forwarded.iter().map(|a| a.to_string()).collect();
            ui::success(&format!("Delivered '{message}' via {}", to.join(", ")));
            for (link, e) in &delivery.failed {
                ui::error(&format!("{link}: {e}"));
            }
            Ok(())
        }
        Commands::Signal {
            message,
            data,
            target,
        } => {
            let bus = connect(&config, &target).await?;
            bus.signal(&message, parse_data(&data)?)?;
            finish(&bus).await;
            ui::success(&format!("Signalled '{message}'"));
            Ok(())
        }
        Commands::Ping {
            message,
            count,
            target,
        } => {
            let bus = connect(&config, &target).await?;
            let mut failure = None;
            for seq in 1..=count.max(1) {
                match bus.ping(&message).await {
                    Ok(elapsed) => ui::kv(
                        &format!("seq {seq}"),
                        &format!("{:.2} ms", elapsed.as_secs_f64() * 1000.0),
                    ),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            finish(&bus).await;
            failure.map_or(Ok(()), Err)
        }
        Commands::Services { target } => {
            let bus = connect(&config, &target).await?;
            let reply = bus.call(SERVICE_LIST, Value::Null).await;
            finish(&bus).await;
            let reply = reply?;
            ui::section(&format!(
                "Services at {}",
                reply["address"].as_str().unwrap_or("?")
            ));
            if let Some(services) = reply["services"].as_object() {
                for (name, served_by) in services {
                    let by: Vec<&str> = served_by
                        .as_array()
                        .map(|a| a.iter().filter_map(Value::as_str).collect())
                        .unwrap_or_default();
                    ui::kv(name, &by.join(", "));
                }
            }
            Ok(())
        }
    }
}

async fn serve(
    config: BusConfig,
    pipe: Option<std::path::PathBuf>,
    ws: Option<String>,
) -> BusResult<()> {
    let mut network = config.network.clone();
    if pipe.is_some() {
        network.pipe_path = pipe;
    }
    if ws.is_some() {
        network.ws_listen = ws;
    }
    if network.pipe_path.is_none() && network.ws_listen.is_none() {
        ui::error_with_fix(
            "No listener configured",
            "pass --pipe <path> or --ws <host:port>, or set [network] in config.toml",
        );
        return Ok(());
    }

    let directory = Directory::with_secret(config.directory.clone(), network.shared_secret.clone())?;
    let node = Node::start(directory, &network).await?;

    ui::section("URNET hub");
    ui::kv("Address", node.directory().address().as_str());
    if let Some(path) = &network.pipe_path {
        ui::kv("Pipe", &path.display().to_string());
    }
    if let Some(addr) = node.ws_local_addr() {
        ui::kv("Web socket", &format!("ws://{addr}"));
    }
    ui::hint("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting the hub down");
    node.shutdown("interrupted").await;
    ui::success("Hub stopped");
    Ok(())
}

/// Dial the hub named on the command line, or the one in the config.
async fn connect(config: &BusConfig, target: &Target) -> BusResult<Messager> {
    let directory = Directory::with_secret(
        config.directory.clone(),
        config.network.shared_secret.clone(),
    )?;

    if let Some(url) = &target.ws {
        let link = connect_ws(&directory, url).await?;
        info!(hub = %url, %link, address = %directory.address(), "Connected");
        return Ok(Messager::new(directory));
    }
    if let Some(path) = target.pipe.as_ref().or(config.network.pipe_path.as_ref()) {
        #[cfg(unix)]
        {
            let link = urnet_wire::connect_pipe(&directory, path).await?;
            info!(hub = %path.display(), %link, address = %directory.address(), "Connected");
            return Ok(Messager::new(directory));
        }
        #[cfg(not(unix))]
        return Err(BusError::Handshake(format!(
            "local pipes are not supported here ({})",
            path.display()
        )));
    }
    if let Some(listen) = &config.network.ws_listen {
        let link = connect_ws(&directory, &format!("ws://{listen}")).await?;
        info!(hub = %listen, %link, address = %directory.address(), "Connected");
        return Ok(Messager::new(directory));
    }
    Err(BusError::Handshake(
        "no hub given: pass --pipe or --ws".to_string(),
    ))
}

fn parse_data(data: &str) -> BusResult<Value> {
    Ok(serde_json::from_str(data)?)
}

/// Say goodbye to the hub and give the writer tasks a moment to flush.
async fn finish(bus: &Messager) {
    debug!(pending = bus.directory().pending_transactions(), "Closing client links");
    bus.directory().shutdown("client done");
    tokio::time::sleep(Duration::from_millis(50)).await;
}
