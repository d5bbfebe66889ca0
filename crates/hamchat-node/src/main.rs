//! hamchat-node -- chat relay server and command-line client.
//!
//! Usage:
//!   hamchat-node                          # Serve with hamchat.toml (or defaults)
//!   hamchat-node serve 9000               # Serve on a specific port
//!   hamchat-node --config relay.toml serve
//!   hamchat-node send --server 127.0.0.1:9000 --username alice --password pw --to bob --body hi
//!   hamchat-node config                   # Print the effective config

use clap::{Parser, Subcommand};
use hamchat_protocol::Response;
use std::io::IsTerminal;

use hamchat_node::client::{RelayClient, Reply};
use hamchat_node::config::HamchatConfig;
use hamchat_node::console::{self, ConsoleExit};
use hamchat_node::server::RelayServer;
use hamchat_node::{expand_tilde, Relay};

#[derive(Parser)]
#[command(name = "hamchat-node", about = "Hamming-coded chat relay", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "hamchat.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server (default)
    Serve {
        /// Port to listen on, overriding server.listen_addr
        port: Option<u16>,
    },
    /// Log in, send one message and print the replies
    Send {
        #[arg(long)]
        server: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        body: String,
        /// Register the account instead of logging in
        #[arg(long)]
        register: bool,
    },
    /// Create an account on a running server
    Register {
        #[arg(long)]
        server: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so console and client output stay clean
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hamchat_node=info,hamchat_storage=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Usage errors exit 1; --help and --version exit 0
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let config_path = expand_tilde(&cli.config);
    let cfg = HamchatConfig::load_or_default(&config_path)
        .map_err(|e| anyhow::anyhow!("loading {}: {e}", config_path.display()))?;

    match cli.command {
        Some(Commands::Serve { port }) => serve(cfg, port).await?,
        None => serve(cfg, None).await?,
        Some(Commands::Send {
            server,
            username,
            password,
            to,
            body,
            register,
        }) => {
            let mut client = RelayClient::connect(server.as_str()).await?;
            let reply = if register {
                client.register(&username, &password).await?
            } else {
                client.login(&username, &password).await?
            };
            print_reply(&reply);
            if !matches!(reply.response, Response::Ok { .. }) {
                std::process::exit(1);
            }

            let reply = client.send_message(&to, &body).await?;
            print_reply(&reply);
            if !matches!(reply.response, Response::Ack { .. }) {
                std::process::exit(1);
            }
        }
        Some(Commands::Register {
            server,
            username,
            password,
        }) => {
            let mut client = RelayClient::connect(server.as_str()).await?;
            let reply = client.register(&username, &password).await?;
            print_reply(&reply);
            if !matches!(reply.response, Response::Ok { .. }) {
                std::process::exit(1);
            }
        }
        Some(Commands::Config) => {
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
    }

    Ok(())
}

async fn serve(mut cfg: HamchatConfig, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(port) = port {
        cfg.server.listen_addr = cfg.server.listen_addr_with_port(port);
    }
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %cfg.server.listen_addr,
        max_sessions = cfg.server.max_sessions,
        "starting hamchat-node"
    );

    let relay = Relay::open(&cfg)?;
    let server = RelayServer::bind(&cfg.server, relay).await?;
    let shutdown_tx = server.shutdown_handle();

    // Operator console on stdin
    {
        let registry = server.relay().registry.clone();
        let shutdown_tx = shutdown_tx.clone();
        let interactive = std::io::stdin().is_terminal();
        tokio::spawn(async move {
            let input = tokio::io::BufReader::new(tokio::io::stdin());
            match console::run_console(input, tokio::io::stdout(), registry, shutdown_tx).await {
                Ok(ConsoleExit::Shutdown) => {}
                Ok(ConsoleExit::Eof) if interactive => {
                    tracing::info!("console closed, server keeps running (Ctrl-C to stop)");
                }
                Ok(ConsoleExit::Eof) => {}
                Err(e) => tracing::warn!("console error: {e}"),
            }
        });
    }

    // Ctrl-C
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received");
                let _ = shutdown_tx.send(());
            }
        });
    }

    server.run().await?;
    tracing::info!("shutdown complete");
    // A pending stdin read cannot be cancelled and would hold the runtime open.
    std::process::exit(0)
}

fn print_reply(reply: &Reply) {
    for c in &reply.corrections {
        println!("corrected bit {} in block {}", c.position, c.block);
    }
    match &reply.response {
        Response::Ok { detail } => println!("OK: {detail}"),
        Response::Ack { seq, delivered } => {
            println!("ACK: stored as #{seq}, delivered to {delivered} session(s)")
        }
        Response::Error { code, detail } => println!("ERROR {code}: {detail}"),
        Response::Deliver(m) => println!("{} -> {}: {}", m.from, m.to, m.body),
        Response::Broadcast { text } => println!("[broadcast] {text}"),
    }
}
