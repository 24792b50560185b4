//! Service entry point: SMTP intake, retention sweeper and HTTP API.

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tempinbox::api::{self, ApiState};
use tempinbox::config::Settings;
use tempinbox::{Inbox, MailStore, SmtpServer, SqliteStore, Sweeper};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    setup_logging(settings.log_level());
    settings.validate()?;

    let store = Arc::new(
        SqliteStore::open(&settings.database_path)
            .with_context(|| format!("opening {}", settings.database_path.display()))?,
    );
    let store: Arc<dyn MailStore> = store;

    let domains = settings.domain_policy();
    if domains.is_open() {
        info!("no allowed domains configured, accepting mail for any domain");
    } else {
        info!(domains = ?domains.domains(), "accepting mail for allowed domains");
    }

    let smtp_listener = tokio::net::TcpListener::bind(settings.smtp_addr())
        .await
        .with_context(|| format!("binding SMTP listener on {}", settings.smtp_addr()))?;
    let smtp_server = SmtpServer::new(settings.smtp_config(), Arc::clone(&store));
    let smtp_shutdown = CancellationToken::new();
    let smtp_task = {
        let token = smtp_shutdown.clone();
        tokio::spawn(async move { smtp_server.run(smtp_listener, token).await })
    };

    let sweeper = Sweeper::new(Arc::clone(&store), settings.cleanup_interval());
    let sweeper_handle = sweeper.start();

    let state = web::Data::new(ApiState::new(Inbox::new(
        Arc::clone(&store),
        settings.inbox_config(),
    )));
    let http_server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(api::configure)
    })
    .disable_signals()
    .bind(settings.api_addr())
    .with_context(|| format!("binding HTTP API on {}", settings.api_addr()))?
    .run();
    let http_handle = http_server.handle();
    let http_task = actix_web::rt::spawn(http_server);
    info!(addr = %settings.api_addr(), "HTTP API listening");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");

    smtp_shutdown.cancel();
    match smtp_task.await {
        Ok(Err(e)) => error!(error = %e, "SMTP server failed"),
        Err(e) => error!(error = %e, "SMTP task panicked"),
        Ok(Ok(())) => {}
    }

    sweeper_handle.stop().await;

    http_handle.stop(true).await;
    if let Ok(Err(e)) = http_task.await {
        error!(error = %e, "HTTP server failed");
    }

    drop(store);
    info!("shutdown complete");
    Ok(())
}

/// Set up tracing on stderr; RUST_LOG overrides the verbosity flag.
fn setup_logging(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
