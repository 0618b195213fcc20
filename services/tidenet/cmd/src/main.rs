//! tidenet binary.
//!
//! `tidenet echo` runs a server that writes every received byte back to
//! its sender. `tidenet pingpong` opens N clients against such a server,
//! keeps one block bouncing per client for a fixed duration, and reports
//! the achieved throughput.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tide_net::{Client, Configure, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::TideConfig;
use logging::TideLogFormatter;

/// How long a graceful stop may take before sessions are cut
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Echo server and ping-pong load client over tidenet
#[derive(Parser, Debug)]
#[command(name = "tidenet", version, about = "Echo server and ping-pong load client")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "tidenet.yaml", global = true)]
    config: PathBuf,

    /// Per-message send timeout, e.g. 500ms (0s disables)
    #[arg(long, global = true)]
    send_timeout: Option<humantime::Duration>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and echo every byte back
    Echo {
        /// Listen URL, e.g. tcp://0.0.0.0:9000 or tls://0.0.0.0:9443
        #[arg(long)]
        listen: Option<String>,

        /// Maximum number of concurrent sessions
        #[arg(long)]
        max_connections: Option<usize>,
    },
    /// Bounce blocks off an echo server and report throughput
    Pingpong {
        /// Target URL, e.g. tcp://127.0.0.1:9000
        #[arg(long)]
        connect: Option<String>,

        /// Number of concurrent clients
        #[arg(long, default_value_t = 4)]
        clients: usize,

        /// Size of the block each client keeps in flight
        #[arg(long, default_value_t = 4096)]
        block_size: usize,

        /// How long to run, e.g. 10s
        #[arg(long, default_value = "10s")]
        duration: humantime::Duration,
    },
}

/// Byte and callback counts shared by every ping-pong client
#[derive(Default)]
struct Traffic {
    bytes: AtomicU64,
    messages: AtomicU64,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("tidenet={}", args.log_level).parse()?)
        .add_directive(format!("tide_net={}", args.log_level).parse()?)
        .add_directive(format!("tide_session={}", args.log_level).parse()?)
        .add_directive(format!("tide_endpoint={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(TideLogFormatter::new("tidenet"))
        .init();

    info!("Starting tidenet v{}", env!("CARGO_PKG_VERSION"));

    let mut config = TideConfig::load_from_file(&args.config)?;
    if let Some(timeout) = args.send_timeout {
        config.limits.send_timeout_ms =
            u64::try_from(Duration::from(timeout).as_millis()).unwrap_or(u64::MAX);
    }

    match args.command {
        Command::Echo {
            listen,
            max_connections,
        } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(max) = max_connections {
                config.limits.max_connections = max;
            }
            run_echo(config).await
        }
        Command::Pingpong {
            connect,
            clients,
            block_size,
            duration,
        } => {
            if let Some(connect) = connect {
                config.connect = connect;
            }
            run_pingpong(config, clients, block_size, duration.into()).await
        }
    }
}

async fn run_echo(config: TideConfig) -> anyhow::Result<()> {
    let server = Server::new();
    server
        .set_limits(config.limits.clone())
        .set_connected_cb(|session| {
            tracing::debug!(component = "echo", peer = ?session.remote_addr(), "session connected");
        })
        .set_disconnected_cb(|session, err| {
            tracing::debug!(component = "echo", peer = ?session.remote_addr(), error = %err, "session closed");
        })
        .set_receive_cb(|session, data| {
            session.send(data.to_vec());
            Ok(data.len())
        });
    if let Some(tls) = config.tls.server_options()? {
        server.set_tls(tls);
    }

    let local = server
        .start(&config.listen)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen))?;
    component_info!("echo", "Listening on {}", local);

    tokio::signal::ctrl_c().await?;
    component_info!("echo", "Stopping with {} open sessions", server.session_count());

    if tokio::time::timeout(DRAIN_GRACE, server.shutdown(false))
        .await
        .is_err()
    {
        component_warn!("echo", "Sessions still open after {:?}, closing them", DRAIN_GRACE);
        server.shutdown(true).await;
    }
    info!("tidenet echo stopped");
    Ok(())
}

async fn run_pingpong(
    config: TideConfig,
    clients: usize,
    block_size: usize,
    duration: Duration,
) -> anyhow::Result<()> {
    anyhow::ensure!(clients > 0, "at least one client is required");
    anyhow::ensure!(block_size > 0, "block size must be positive");

    let tls = config.tls.client_options()?;
    let traffic = Arc::new(Traffic::default());
    let mut running = Vec::with_capacity(clients);

    for n in 0..clients {
        let client = Client::new();
        let counters = traffic.clone();
        client
            .set_limits(config.limits.clone())
            .set_receive_cb(move |session, data| {
                counters.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                counters.messages.fetch_add(1, Ordering::Relaxed);
                session.send(data.to_vec());
                Ok(data.len())
            })
            .set_disconnected_cb(move |_, err| {
                tracing::debug!(component = "pingpong", client = n, error = %err, "client disconnected");
            });
        if let Some(tls) = &tls {
            client.set_tls(tls.clone());
        }

        client
            .connect(&config.connect)
            .await
            .with_context(|| format!("client {} failed to connect to {}", n, config.connect))?;
        running.push(client);
    }
    component_info!(
        "pingpong",
        "{} clients connected to {}, block size {}",
        clients,
        config.connect,
        block_size
    );

    let started = Instant::now();
    for client in &running {
        client.send(vec![0x5a_u8; block_size]);
    }
    tokio::time::sleep(duration).await;
    let elapsed = started.elapsed();

    for client in &running {
        client.shutdown(true);
    }

    let bytes = traffic.bytes.load(Ordering::Relaxed);
    let messages = traffic.messages.load(Ordering::Relaxed);
    let average = if messages == 0 { 0 } else { bytes / messages };
    let mib_per_sec = bytes as f64 / elapsed.as_secs_f64() / (1024.0 * 1024.0);

    component_info!(
        "pingpong",
        "{} bytes in {} messages over {:.2}s: average {} bytes, {:.2} MiB/s",
        bytes,
        messages,
        elapsed.as_secs_f64(),
        average,
        mib_per_sec
    );
    Ok(())
}
