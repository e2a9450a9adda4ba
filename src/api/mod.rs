pub mod error;
pub mod vm;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::controller::VmController;

pub struct ApiState {
    pub controller: Arc<VmController>,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub host: String,
    pub port: u16,
}

pub fn app(state: Arc<ApiState>) -> Router {
    Router::new().merge(vm::router()).with_state(state)
}

pub struct ApiServer {
    state: Arc<ApiState>,
    config: ApiServerConfig,
}

impl ApiServer {
    pub fn new(controller: Arc<VmController>, config: ApiServerConfig) -> Self {
        Self {
            state: Arc::new(ApiState { controller }),
            config,
        }
    }

    /// Serves until `shutdown` is cancelled, then drains in-flight requests.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let app = app(self.state);

        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("starting api server on {}", addr);

        let listener = TcpListener::bind(addr).await?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("api server stopped");
        Ok(())
    }
}
