//! Remote execution agent.
//!
//! Accepts transport connections and runs backup, restore and purge plugin
//! pipelines on behalf of remote callers, streaming their output back.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use remote_exec_agent::{Agent, AgentConfig, AgentError, ConfigOverrides, DispatchMode};
use remote_exec_catalog::Catalog;
use remote_exec_core::ExitStatus;
use remote_exec_executor::AgentRequestParser;
use remote_exec_transport::{ChannelEvent, ClientConfig, connect, load_secret_key};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Remote execution agent
#[derive(Parser, Debug)]
#[command(name = "remote-exec-agent", version)]
#[command(about = "Relay exec requests from remote callers to local plugin pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and serve exec requests
    Serve {
        /// JSON config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Address to listen on
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Catalog database to bootstrap before serving
        #[arg(long)]
        database: Option<PathBuf>,
        /// Serve a single connection and exit
        #[arg(long)]
        once: bool,
    },
    /// Send one exec request to an agent and print its output
    Exec {
        /// Agent address
        #[arg(long)]
        connect: SocketAddr,
        /// Password accepted by the agent
        #[arg(long)]
        token: Option<String>,
        /// Private key to authenticate with
        #[arg(long)]
        identity: Option<PathBuf>,
        /// Expected agent host key fingerprint (SHA256:...)
        #[arg(long)]
        host_fingerprint: Option<String>,
        /// User name presented to the agent
        #[arg(long, default_value = "remote-exec-cli")]
        user: String,
        /// Request payload (JSON)
        payload: String,
    },
    /// Create or verify the catalog schema
    SetupDb {
        /// Catalog database path
        #[arg(long)]
        database: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            listen,
            database,
            once,
        } => {
            let config = load_config(
                config.as_deref(),
                ConfigOverrides {
                    listen,
                    database_path: database,
                },
            )?;
            init_tracing(&config.log_level, config.log_json);
            serve(&config, once).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Exec {
            connect,
            token,
            identity,
            host_fingerprint,
            user,
            payload,
        } => {
            init_tracing("warn", false);
            let mut config = ClientConfig::new(user);
            if let Some(token) = token {
                config = config.with_token(token);
            }
            if let Some(path) = identity {
                config = config.with_identity(load_secret_key(&path)?);
            }
            if let Some(fingerprint) = host_fingerprint {
                config = config.with_host_fingerprint(fingerprint);
            }
            exec(connect, &config, &payload).await
        }
        Command::SetupDb { database } => {
            init_tracing("info", false);
            let catalog = Catalog::open(&database).await?;
            catalog.setup().await?;
            tracing::info!(
                path = %database.display(),
                version = catalog.schema_version().await?,
                "Catalog ready"
            );
            catalog.close().await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn load_config(
    path: Option<&Path>,
    overrides: ConfigOverrides,
) -> Result<AgentConfig, AgentError> {
    let mut config = AgentConfig::load(path, |k| std::env::var(k).ok())?;
    config.apply_overrides(overrides);
    Ok(config)
}

async fn serve(config: &AgentConfig, once: bool) -> Result<(), AgentError> {
    if let Some(path) = &config.database_path {
        let catalog = Catalog::open(path).await?;
        catalog.setup().await?;
        catalog.close().await;
    }

    let agent = Agent::new(config.server_config()?, AgentRequestParser)
        .with_options(config.agent_options());

    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(|source| AgentError::Bind {
            addr: config.listen,
            source,
        })?;

    if once {
        agent.serve_one(&listener, DispatchMode::Inline).await
    } else {
        agent.serve_until(listener, shutdown_signal()).await
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

async fn exec(addr: SocketAddr, config: &ClientConfig, payload: &str) -> anyhow::Result<ExitCode> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {addr}"))?;

    let client = connect(stream, config).await?;
    let mut channel = client.open_session().await?;

    if !channel.exec_request(payload.as_bytes()).await? {
        anyhow::bail!("Agent rejected the exec request");
    }

    let mut stdout = tokio::io::stdout();
    let mut status = None;
    while let Some(event) = channel.next_event().await {
        match event {
            ChannelEvent::Data(data) => {
                stdout.write_all(&data).await?;
                stdout.flush().await?;
            }
            ChannelEvent::ExitStatus(frame) => status = ExitStatus::from_frame(&frame),
            ChannelEvent::Closed => break,
            ChannelEvent::Reply(_) => {}
        }
    }
    if let Err(e) = client.disconnect().await {
        tracing::debug!("Disconnect failed: {e}");
    }

    let status = status.context("Channel closed without an exit status")?;
    Ok(ExitCode::from(status.code()))
}
