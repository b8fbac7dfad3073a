use axum::{
    routing::get,
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::admin;
use crate::handlers::{delete_key, get_key, health_check, not_found, put_key};
use crate::{ApiError, ApiResult, AppState};

/// Serves the client API and the admin API on their own listeners.
pub struct Server {
    config: crate::Config,
    app_state: Arc<AppState>,
}

impl Server {
    pub fn new(config: crate::Config, app_state: Arc<AppState>) -> Self {
        Self { config, app_state }
    }

    /// Binds both listeners and serves until `shutdown` flips to true.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> ApiResult<()> {
        let client = bind(&self.config.api_addr).await?;
        let admin = bind(&self.config.admin_addr).await?;
        tracing::info!(
            api = %self.config.api_addr,
            admin = %self.config.admin_addr,
            "Starting API servers"
        );

        let client = serve(client, self.client_router(), shutdown.clone());
        let admin = serve(admin, self.admin_router(), shutdown);
        tokio::try_join!(client, admin)?;
        Ok(())
    }

    pub fn client_router(&self) -> Router {
        let api_routes = Router::new()
            .route("/kv/*key", get(get_key).put(put_key).delete(delete_key))
            .route("/health", get(health_check))
            .with_state(self.app_state.clone());

        with_layers(api_routes)
    }

    pub fn admin_router(&self) -> Router {
        let admin_routes = Router::new()
            .route("/health", get(health_check))
            .route("/status", get(admin::status))
            .route("/membership", get(admin::membership))
            .route("/ring", get(admin::ring))
            .route("/ring/partitions", get(admin::partitions))
            .route("/hints", get(admin::hints))
            .with_state(self.app_state.clone());

        with_layers(admin_routes)
    }
}

fn with_layers(routes: Router) -> Router {
    routes
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .fallback(not_found)
}

async fn bind(addr: &str) -> ApiResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to bind to {}: {}", addr, e)))
}

async fn serve(listener: TcpListener, app: Router, mut shutdown: watch::Receiver<bool>) -> ApiResult<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))
}
