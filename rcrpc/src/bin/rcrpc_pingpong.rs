//! Loopback ping-pong benchmark through the typed layer.
//!
//! Bootstraps a multi-endpoint session against an in-process acceptor, serves
//! every endpoint with its own `TypedServer`, and drives a `ClientMux` with
//! concurrent callers.
//!
//! Run with:
//! ```bash
//! cargo run --release -p rcrpc --bin rcrpc_pingpong -- -e 4 -c 64 -i 100000 -s 32,256
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use rcrpc::log::{self, LogLevel};
use rcrpc::{
    Acceptor, ClientMux, Connector, Handshake, RpcConfig, TypedClient, TypedRpcConfig, TypedServer,
};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "rcrpc_pingpong")]
#[command(about = "Loopback ping-pong benchmark over the typed RPC layer")]
struct Args {
    /// Number of calls per run
    #[arg(short, long, default_value = "100000")]
    iterations: u64,

    /// Payload sizes (comma-separated)
    #[arg(short = 's', long, value_delimiter = ',', default_value = "32")]
    message_sizes: Vec<usize>,

    /// Number of endpoints in the session
    #[arg(short, long, default_value = "4")]
    endpoints: u32,

    /// Concurrent callers
    #[arg(short, long, default_value = "64")]
    concurrency: usize,

    /// Slots per endpoint
    #[arg(long, default_value = "64")]
    max_inflight: usize,

    /// Server workers per endpoint
    #[arg(long, default_value = "2")]
    server_threads: usize,

    /// Number of warmup calls
    #[arg(short, long, default_value = "1000")]
    warmup: u64,

    /// Number of runs per message size
    #[arg(short, long, default_value = "3")]
    runs: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: LogLevel,
}

// =============================================================================
// RPC Functions
// =============================================================================

#[derive(Serialize, Deserialize)]
struct Ping {
    seq: u64,
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct Pong {
    seq: u64,
    len: u32,
}

fn pong(req: Ping) -> Pong {
    Pong {
        seq: req.seq,
        len: req.payload.len() as u32,
    }
}

rcrpc::rpc_handler!(PingPong, pong, Ping => Pong);

// =============================================================================
// Benchmark
// =============================================================================

struct RunResult {
    elapsed: Duration,
    calls: u64,
}

impl RunResult {
    fn mops(&self) -> f64 {
        self.calls as f64 / self.elapsed.as_secs_f64() / 1e6
    }

    fn avg_latency_us(&self, concurrency: usize) -> f64 {
        self.elapsed.as_secs_f64() * 1e6 * concurrency as f64 / self.calls as f64
    }
}

async fn run_once(
    client: &Arc<TypedClient<ClientMux>>,
    calls: u64,
    concurrency: usize,
    message_size: usize,
) -> rcrpc::Result<RunResult> {
    let per_caller = calls.div_ceil(concurrency as u64);
    let start = Instant::now();
    let mut callers = JoinSet::new();
    for caller in 0..concurrency {
        let client = Arc::clone(client);
        callers.spawn(async move {
            let mut req = Ping {
                seq: 0,
                payload: vec![caller as u8; message_size],
            };
            for seq in 0..per_caller {
                req.seq = seq;
                let resp = client.call::<PingPong>(&req).await?;
                debug_assert_eq!(resp.seq, seq);
                debug_assert_eq!(resp.len as usize, message_size);
            }
            Ok::<_, rcrpc::Error>(())
        });
    }
    while let Some(joined) = callers.join_next().await {
        joined.map_err(|e| rcrpc::Error::Io(std::io::Error::other(e)))??;
    }
    Ok(RunResult {
        elapsed: start.elapsed(),
        calls: per_caller * concurrency as u64,
    })
}

async fn run(args: Args) -> rcrpc::Result<()> {
    let max_payload = args.message_sizes.iter().copied().max().unwrap_or(0) + 64;
    let rpc = RpcConfig::default()
        .with_max_inflight(args.max_inflight)
        .with_max_request_payload(max_payload.max(4096));
    let config = TypedRpcConfig::new().with_rpc(rpc);
    let conn = config.to_conn_config();

    let server_device = rcrpc::verbs::Device::open(config.device_nr, config.port_nr)?;
    let client_device = rcrpc::verbs::Device::open(config.device_nr, config.port_nr)?;
    let acceptor = Acceptor::new(0, server_device.alloc_pd()?, conn);
    let connector = Connector::new(client_device.alloc_pd()?, conn);
    let port = acceptor.local_addr().port();

    let handshake = Handshake::new(args.endpoints, std::process::id() as u64);
    let (client_side, accepted) = tokio::join!(
        connector.connect_multiple("127.0.0.1", port, &handshake),
        acceptor.accept_multiple()
    );
    let (server_side, received) = accepted?;
    tracing::info!(
        endpoints = received.endpoint_count,
        session_id = received.session_id,
        "session established"
    );

    let mut servers = Vec::new();
    let mut serving = JoinSet::new();
    for endpoint in server_side {
        let server = Arc::new(TypedServer::new(endpoint, rpc, args.server_threads)?);
        server.register_handler::<PingPong>();
        let runner = Arc::clone(&server);
        serving.spawn(async move { runner.run().await });
        servers.push(server);
    }

    let client = Arc::new(TypedClient::new(ClientMux::from_endpoints(client_side?, rpc)?));

    for &message_size in &args.message_sizes {
        run_once(&client, args.warmup, args.concurrency, message_size).await?;
        for run in 0..args.runs {
            let result = run_once(&client, args.iterations, args.concurrency, message_size).await?;
            println!(
                "size={}B run={} calls={} elapsed={:.3}s throughput={:.3} Mops avg_latency={:.2}us",
                message_size,
                run,
                result.calls,
                result.elapsed.as_secs_f64(),
                result.mops(),
                result.avg_latency_us(args.concurrency),
            );
        }
    }

    for server in &servers {
        server.shutdown();
    }
    while let Some(joined) = serving.join_next().await {
        if let Ok(Err(e)) = joined {
            tracing::warn!(error = %e, "server exited with error");
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    log::init(args.log_level);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(run(args)) {
        tracing::error!(error = %e, "benchmark failed");
        std::process::exit(1);
    }
}
