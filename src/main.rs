use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use http::HeaderValue;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use camp_checkout_api as api;
use api::{
    notifications::{HttpNotificationDelivery, LogNotificationDelivery, NotificationDelivery},
    payments::{HttpPaymentGateway, HttpPaymentGatewayConfig, PaymentGateway},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db = Arc::new(db_pool);

    let gateway: Arc<dyn PaymentGateway> = Arc::new(
        HttpPaymentGateway::new(HttpPaymentGatewayConfig::from(&cfg))
            .context("failed to build payment gateway client")?,
    );

    let delivery: Arc<dyn NotificationDelivery> = match cfg.notification_delivery_url.clone() {
        Some(url) => {
            info!(endpoint = %url, "HTTP notification delivery enabled");
            Arc::new(
                HttpNotificationDelivery::new(
                    url,
                    cfg.notification_signing_secret.clone(),
                    cfg.notification_max_retries,
                )
                .context("failed to build notification client")?,
            )
        }
        None => {
            warn!("No notification delivery URL configured; notifications will only be logged");
            Arc::new(LogNotificationDelivery)
        }
    };

    let cors_layer = build_cors(&cfg)?;
    let components = api::AppState::build(cfg.clone(), db, gateway, delivery).await?;

    let worker = if cfg.job_worker_enabled {
        Some(components.job_worker.spawn())
    } else {
        info!("Scheduled job worker disabled");
        None
    };

    let app = api::app_router(components.state).layer(cors_layer);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.host, cfg.port))?;
    info!("camp-checkout-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(worker) = worker {
        worker.abort();
    }
    info!("Shutdown complete");
    Ok(())
}

fn build_cors(cfg: &api::config::AppConfig) -> anyhow::Result<CorsLayer> {
    let configured_origins: Option<Vec<HeaderValue>> = cfg
        .cors_allowed_origins
        .as_ref()
        .map(|raw| {
            raw.split(',')
                .filter_map(|origin| {
                    let trimmed = origin.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        HeaderValue::from_str(trimmed).ok()
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty());

    if let Some(origins) = configured_origins {
        Ok(CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any))
    } else if cfg.should_allow_permissive_cors() {
        info!("Using permissive CORS because explicit origins were not configured");
        Ok(CorsLayer::permissive())
    } else {
        anyhow::bail!(
            "Missing CORS configuration: set APP__CORS_ALLOWED_ORIGINS or APP__CORS_ALLOW_ANY_ORIGIN=true"
        )
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
