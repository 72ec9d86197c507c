use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;
use pairpad_collab::{MemoryRoomStore, RocksRoomStore, RoomHub, RoomStore, SyncServer};
use pairpad_exec::ProcessRuntime;
use pairpad_server::api::{self, AppState};
use pairpad_server::config::{Cli, Command, RunArgs, ServeArgs};
use pairpad_server::runner;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Run(args) => {
            let code = run(args).await?;
            std::process::exit(code);
        }
    }
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn RoomStore> = match args.store_config() {
        Some(config) => {
            info!("Room snapshots in {}", config.path.display());
            Arc::new(RocksRoomStore::open(config)?)
        }
        None => {
            info!("Room snapshots kept in memory");
            Arc::new(MemoryRoomStore::new())
        }
    };

    let hub = Arc::new(RoomHub::new(args.hub_config(), store));
    let sync = SyncServer::new(args.server_config(), hub.clone());

    // Drop handles of collected rooms
    let pruner = hub.clone();
    let interval = pruner.config().grace_period.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let pruned = pruner.prune().await;
            if pruned > 0 {
                log::debug!("Pruned {pruned} collected rooms");
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&args.http_addr).await?;
    info!("HTTP API listening on {}", args.http_addr);
    let http = axum::serve(listener, api::router(AppState::new(hub.clone())));

    tokio::select! {
        result = sync.run() => result?,
        result = http.into_future() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = hub.stats().await;
            info!(
                "Shutting down: {} rooms live, {} edits, {} connections served",
                stats.active_rooms, stats.total_edits, stats.total_connections
            );
            let persisted = hub.shutdown().await;
            info!("Stopped {persisted} rooms");
        }
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let code = tokio::fs::read_to_string(&args.file).await?;
    let runtime = Arc::new(ProcessRuntime::new(args.runtime_config()));
    info!("Running {} with {}", args.file.display(), args.program);

    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let exit_code = runner::run_script(
        runtime,
        args.supervisor_config(),
        code,
        &mut tokio::io::stdout(),
        &mut tokio::io::stderr(),
        interrupt,
    )
    .await?;
    Ok(exit_code)
}
