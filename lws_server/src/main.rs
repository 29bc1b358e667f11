//! Light-wallet server: scans the chain for registered view keys and serves
//! balances, transactions and unspent outputs over a small JSON API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lws_db::Storage;
use lws_primitives::Network;
use lws_scanner::Scanner;

mod rest;

#[derive(Debug, Parser)]
#[command(name = "lws-server", about = "Scanner and JSON API for light wallets")]
struct Options {
    /// Path of the accounts database
    #[arg(long, default_value = "lws.db")]
    db_file: PathBuf,

    /// host:port of the full node's message socket
    #[arg(long, default_value = "127.0.0.1:18082")]
    daemon: String,

    /// Address to serve the JSON API on
    #[arg(long, default_value = "127.0.0.1:8080")]
    rest_listen: SocketAddr,

    /// Number of scan worker threads
    #[arg(long, default_value_t = 1)]
    scan_threads: usize,

    /// Network to scan: mainnet, testnet or stagenet
    #[arg(long, default_value = "mainnet", value_parser = parse_network)]
    network: Network,

    /// Maximum pending account-creation requests
    #[arg(long, default_value_t = 50)]
    create_queue_max: usize,

    /// Create accounts immediately on login instead of queueing a request
    #[arg(long)]
    auto_accept_creation: bool,
}

fn parse_network(value: &str) -> Result<Network, String> {
    match value {
        "mainnet" => Ok(Network::Mainnet),
        "testnet" => Ok(Network::Testnet),
        "stagenet" => Ok(Network::Stagenet),
        other => Err(format!("unknown network '{}'", other)),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("lws-server: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let options = Options::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!(
        "Opening database {} for {}",
        options.db_file.display(),
        options.network
    );
    let storage = Storage::open(&options.db_file, options.network, options.create_queue_max)?;

    let scanner = Scanner::new(storage.clone(), options.daemon.clone(), options.scan_threads);
    let handle = scanner.handle();
    let scan_thread = std::thread::Builder::new()
        .name("scanner".into())
        .spawn(move || scanner.run())?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let app = rest::router(rest::ApiState {
            storage,
            network: options.network,
            auto_accept_creation: options.auto_accept_creation,
        });
        let listener = tokio::net::TcpListener::bind(options.rest_listen).await?;
        info!("Serving JSON API on {}", options.rest_listen);

        let shutdown = handle.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("Interrupt received, shutting down");
                shutdown.stop();
            })
            .await
    })?;

    handle.stop();
    match scan_thread.join() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err("scanner thread panicked".into()),
    }
}
