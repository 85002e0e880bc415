//! Process bootstrap: binds the listening socket, accepts connections, and
//! spawns per-connection workers. Deliberately thin — flag parsing and the
//! accept loop are the only things that live here; everything else is in
//! the library.

use std::sync::Arc;

use redpoint::config::{self, Config};
use redpoint::dispatch::{run_connection, Server};
use redpoint::persistence::FileSnapshotStore;
use redpoint::replication::replica;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let raw_args: Vec<String> = std::env::args().skip(1).collect();
    let config = match config::parse_args(&raw_args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("redpoint: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        eprintln!("redpoint: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let port = config.port;
    let replicaof = config.replicaof.clone();
    let persistence = Arc::new(FileSnapshotStore);
    let server = Server::new(config, persistence);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, role = ?server.role, "redpoint listening");

    if let Some((host, master_port)) = replicaof {
        let keyspace = server.keyspace.clone();
        tokio::spawn(async move {
            if let Err(e) = replica::run((host, master_port), port, keyspace).await {
                tracing::warn!(error = %e, "replication link to master ended");
            }
        });
    }

    loop {
        let (socket, peer) = listener.accept().await?;
        let server = server.clone();
        tracing::debug!(%peer, "accepted connection");
        tokio::spawn(async move {
            run_connection(server, socket).await;
        });
    }
}
