use std::sync::Arc;

use clap::Parser;
use iqdb::DB;
use iqdb_server::router;
use tokio::sync::RwLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(about = "Reverse image search server")]
struct Args {
    /// The address to bind to
    #[arg(long = "host", default_value = "0.0.0.0")]
    host: String,
    /// The port to listen on
    #[arg(short = 'p', long = "port", default_value_t = 5588)]
    port: u16,
    /// The path to the sqlite db; ":memory:" for an ephemeral one
    #[arg(short = 'd', long = "database", default_value = "iqdb.sqlite")]
    database: String,
}

/// Resolves on SIGINT or SIGTERM so in-flight requests can drain.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining connections...");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "iqdb=info,iqdb_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let db = match DB::open(&args.database) {
        Ok(db) => db,
        Err(error) => {
            tracing::error!(%error, database = %args.database, "failed to open database");
            std::process::exit(1);
        }
    };
    let app = router(Arc::new(RwLock::new(db)));

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    tracing::info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();
    tracing::info!("server stopped");
}
