mod backhaul;

use clap::{Parser, Subcommand};

use crate::backhaul::app::Mode;

#[derive(Debug, Parser)]
#[command(
    name = "backhaul",
    version,
    about = "Backhaul - expose a TCP service behind NAT through a public broker"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses BACKHAUL_CONFIG; then auto-detects backhaul.toml > backhaul.yaml > backhaul.yml from CWD; then falls back to the OS default path (Linux: /etc/backhaul/backhaul.toml; others: user config dir).
    #[arg(long, env = "BACKHAUL_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the public broker.
    Server {
        /// Control listener address, e.g. 127.0.0.1:9201 or :9201.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Connect to a broker and expose a local target through it.
    Client {
        /// Broker control address.
        #[arg(long)]
        host: Option<String>,
        /// Port the broker should expose publicly.
        #[arg(long)]
        expose: Option<u16>,
        /// Local service to forward to (host or host:port, port 80 if omitted).
        #[arg(long)]
        target: Option<String>,
        /// Name sent to the broker in the handshake.
        #[arg(long)]
        name: Option<String>,
    },
}

impl From<Command> for Mode {
    fn from(c: Command) -> Self {
        match c {
            Command::Server { bind } => Mode::Server { bind },
            Command::Client {
                host,
                expose,
                target,
                name,
            } => Mode::Client {
                host,
                expose,
                target,
                name,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    backhaul::run(cli.config, cli.command.into()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_flags() {
        let cli = Cli::try_parse_from([
            "backhaul", "client", "--host", "broker:9201", "--expose", "18080", "--target", "127.0.0.1:9000",
        ])
        .unwrap();
        match Mode::from(cli.command) {
            Mode::Client { host, expose, target, name } => {
                assert_eq!(host.as_deref(), Some("broker:9201"));
                assert_eq!(expose, Some(18080));
                assert_eq!(target.as_deref(), Some("127.0.0.1:9000"));
                assert_eq!(name, None);
            }
            other => panic!("unexpected mode: {other:?}"),
        }
    }

    #[test]
    fn rejects_out_of_range_port() {
        assert!(Cli::try_parse_from(["backhaul", "client", "--expose", "70000"]).is_err());
    }
}
