use std::error::Error;

use lastseen::config::Configuration;
use lastseen::seed::{self, SeedAccount};
use lastseen::{app, initialize_state, telemetry};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter).with(fmt::layer());

    // read configuration file. let it in memory.
    // Global subscriber depends on it, so log its errors to a scoped one.
    let path = std::env::var("CONFIG_PATH").unwrap_or_default();
    let config = tracing::subscriber::with_default(tracing_subscriber::fmt().finish(), || {
        Configuration::default().path(path.into()).read()
    })?;

    match config.telemetry.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            opentelemetry::global::set_tracer_provider(telemetry::setup_tracer(
                endpoint,
            )?);
            registry.with(telemetry::setup_logging(endpoint)?).init();
        },
        None => registry.init(),
    }

    if std::env::args().nth(1).as_deref() == Some("seed") {
        seed::run(&config, &SeedAccount::from_env()).await?;
        return Ok(());
    }

    let metrics = if config.telemetry.prometheus {
        Some(telemetry::setup_metrics_recorder()?)
    } else {
        None
    };

    let state = initialize_state(config, metrics).await?;

    if state.db.is_none() {
        // Nothing persists: give a fresh memory store an account to log in with.
        seed::seed(state.users.as_ref(), &state.pwd, &SeedAccount::from_env()).await?;
    }

    let address = state.config.listen_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(%address, "server started");

    let db = state.db.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(db) = db {
        db.close().await;
    }
    tracing::info!("server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(err) => {
                tracing::error!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
