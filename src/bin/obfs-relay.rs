//! Obfs Relay
//!
//! Runs either end of a disguised tunnel:
//! - `server`: accepts disguised connections, unwraps them and relays to a
//!   fixed target
//! - `client`: accepts local TCP connections and relays them through a
//!   disguised connection to the server

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use obfs_tunnel::{
    config::{self, ClientConfig, Config, LoggingConfig, ServerConfig},
    obfuscation::Connector,
    pool::IdlePool,
    transport::{ListenerConfig, ObfsListener, TcpConn, TransportConfig},
    tunnel, Conn,
};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Obfs Relay - disguised proxy tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "obfs-relay")]
#[command(about = "Obfs Relay - HTTP/TLS traffic disguise for proxy tunnels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept disguised connections and relay them to the target
    Server {
        /// Listen address (overrides config)
        #[arg(short, long)]
        listen: Option<String>,

        /// Relay target (overrides config)
        #[arg(short, long)]
        target: Option<String>,
    },
    /// Relay local connections through a disguised connection
    Client {
        /// Local listen address (overrides config)
        #[arg(short, long)]
        listen: Option<String>,

        /// Server address (overrides config)
        #[arg(short, long)]
        server: Option<String>,
    },
    /// Print an example configuration, or write it to a file
    ExampleConfig {
        /// Write to this path instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::ExampleConfig { output } = &args.command {
        let example = config::generate_example_config();
        match output {
            Some(path) => example
                .save(path)
                .context("Failed to write example config")?,
            None => println!(
                "{}",
                toml::to_string_pretty(&example).context("Failed to render example config")?
            ),
        }
        return Ok(());
    }

    let config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };

    init_logging(&config.logging, args.log_level.as_deref());
    info!("Obfs Relay v{}", obfs_tunnel::VERSION);

    match args.command {
        Command::Server { listen, target } => {
            let mut server = config.server.unwrap_or_default();
            if let Some(listen) = listen {
                server.listen = listen;
            }
            if let Some(target) = target {
                server.target = target;
            }
            run_server(server, config.transport).await
        }
        Command::Client { listen, server } => {
            let mut client = config
                .client
                .ok_or_else(|| anyhow!("No [client] section in config file"))?;
            if let Some(listen) = listen {
                client.listen = listen;
            }
            if let Some(server) = server {
                client.server = server;
            }
            run_client(client, config.transport).await
        }
        Command::ExampleConfig { .. } => Ok(()),
    }
}

fn init_logging(logging: &LoggingConfig, level: Option<&str>) {
    let level = level.unwrap_or(&logging.level);
    let builder = tracing_subscriber::fmt().with_env_filter(level);
    if logging.format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}

async fn run_server(server: ServerConfig, transport: TransportConfig) -> Result<()> {
    let listener_config = ListenerConfig {
        drain_timeout: server.drain_timeout(),
        ..Default::default()
    };
    let listener = ObfsListener::bind(&server.listen, listener_config, transport.clone())
        .await
        .context("Failed to bind to address")?;
    info!("Relaying to {}", server.target);

    let semaphore = Arc::new(Semaphore::new(server.max_connections));
    let target = Arc::new(server.target);
    let transport = Arc::new(transport);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let accepted = accepted.context("Listener stopped")?;
                let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Connection limit reached, dropping {:?}", accepted.conn.peer_addr());
                        let _ = accepted.conn.close().await;
                        continue;
                    }
                };

                let target = Arc::clone(&target);
                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    let _permit = permit;
                    debug!("{} session from {:?}", accepted.kind, accepted.conn.peer_addr());
                    match TcpConn::connect(&target, &transport).await {
                        Ok(upstream) => {
                            tunnel::relay(&*accepted.conn, &upstream).await;
                        }
                        Err(e) => {
                            error!("Target connection failed: {}", e);
                            let _ = accepted.conn.close().await;
                        }
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    Ok(())
}

async fn run_client(client: ClientConfig, transport: TransportConfig) -> Result<()> {
    let mut connector = Connector::new(client.server.clone())
        .with_mode(client.mode)
        .with_hosts(client.obfs_hosts.clone())
        .with_profile(client.browser_profile())
        .with_transport(transport.clone());
    if client.pool_capacity > 0 {
        connector = connector.with_pool(Arc::new(IdlePool::new(
            client.pool_capacity,
            client.pool_idle(),
        )));
    }
    let connector = Arc::new(connector);

    let listener = TcpListener::bind(&client.listen)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on {}, server {} ({:?})", client.listen, client.server, client.mode);

    let transport = Arc::new(transport);
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!("New connection from {}", peer_addr);
                        let connector = Arc::clone(&connector);
                        let local = TcpConn::from_stream(stream, &transport);
                        tokio::spawn(async move {
                            match connector.connect().await {
                                Ok(remote) => {
                                    tunnel::relay(&local, &*remote).await;
                                }
                                Err(e) => {
                                    error!("Server connection failed: {}", e);
                                    let _ = local.close().await;
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    Ok(())
}
