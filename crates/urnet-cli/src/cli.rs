//! Clap CLI definitions for URNET.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  urnet serve --ws 127.0.0.1:7700          Host a hub on a web socket
  urnet serve --pipe /tmp/urnet.sock       Host a hub on a local pipe
  urnet call NET:SRV_REFLECT --data '{\"x\":5}' --ws ws://127.0.0.1:7700
  urnet services --pipe /tmp/urnet.sock    List what the hub can route

\x1b[1;36mLogging:\x1b[0m
  RUST_LOG=debug urnet serve ...           Per-packet routing logs";

/// URNET — addressed message bus.
#[derive(Parser)]
#[command(
    name = "urnet",
    version,
    about = "URNET addressed message bus: host a hub or talk to one",
    after_help = AFTER_HELP,
)]
pub struct Cli {
    /// Path to config file (default: ~/.urnet/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Which hub a one-shot client command dials.
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Local pipe path of the hub.
    #[arg(long, conflicts_with = "ws")]
    pub pipe: Option<PathBuf>,

    /// Web socket URL of the hub (ws://host:port).
    #[arg(long)]
    pub ws: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Host a hub until Ctrl+C. Flags override the [network] config table.
    Serve {
        /// Local pipe path to listen on.
        #[arg(long)]
        pipe: Option<PathBuf>,

        /// Web socket address to listen on (host:port).
        #[arg(long)]
        ws: Option<String>,
    },
    /// Call a message and print its result.
    Call {
        /// Message name, e.g. `NET:SRV_REFLECT`.
        message: String,

        /// JSON payload.
        #[arg(long, default_value = "{}")]
        data: String,

        /// Also print the hop sequence and hop log of the response.
        #[arg(long)]
        trace: bool,

        #[command(flatten)]
        target: Target,
    },
    /// Send a message and report where it was delivered.
    Send {
        message: String,

        #[arg(long, default_value = "{}")]
        data: String,

        #[command(flatten)]
        target: Target,
    },
    /// Fire a signal and exit.
    Signal {
        message: String,

        #[arg(long, default_value = "{}")]
        data: String,

        #[command(flatten)]
        target: Target,
    },
    /// Measure the round trip to whoever services a message.
    Ping {
        #[arg(default_value = "NET:SRV_REFLECT")]
        message: String,

        /// Number of pings.
        #[arg(long, short = 'n', default_value_t = 1)]
        count: u32,

        #[command(flatten)]
        target: Target,
    },
    /// List the names the hub can route and who serves them.
    Services {
        #[command(flatten)]
        target: Target,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_call_parses_target_and_payload() {
        let cli = Cli::try_parse_from([
            "urnet", "call", "FOO", "--data", "{\"x\":5}", "--ws", "ws://127.0.0.1:7700",
        ])
        .unwrap();
        match cli.command {
            Commands::Call {
                message,
                data,
                target,
                trace,
            } => {
                assert_eq!(message, "FOO");
                assert_eq!(data, "{\"x\":5}");
                assert_eq!(target.ws.as_deref(), Some("ws://127.0.0.1:7700"));
                assert!(!trace);
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn test_pipe_and_ws_conflict() {
        assert!(Cli::try_parse_from([
            "urnet", "services", "--pipe", "/tmp/x.sock", "--ws", "ws://h:1"
        ])
        .is_err());
    }
}
