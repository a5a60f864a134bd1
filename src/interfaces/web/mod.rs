mod error;
mod handlers;
mod router;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::config::{GatewaySettings, ServiceSettings};
use crate::core::correlator::CorrelationTable;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::store::ChatStore;
use crate::core::transport::{QueueTransport, RetryPolicy, connect_with_retry};

pub struct ApiServer {
    config: ApiServerConfig,
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

pub struct ApiServerConfig {
    /// Publishing connection; never shared with a consumer.
    pub publisher: Arc<dyn QueueTransport>,
    pub table: Arc<CorrelationTable>,
    pub store: Arc<dyn ChatStore>,
    pub request_queue: String,
    pub retry: RetryPolicy,
    pub gateway: GatewaySettings,
    pub service: ServiceSettings,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) publisher: Arc<dyn QueueTransport>,
    pub(crate) table: Arc<CorrelationTable>,
    pub(crate) store: Arc<dyn ChatStore>,
    pub(crate) request_queue: String,
    pub(crate) gateway: Arc<GatewaySettings>,
    pub(crate) service: Arc<ServiceSettings>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            local_addr: None,
            task: None,
        }
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server Interface initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        connect_with_retry(self.config.publisher.as_ref(), self.config.retry).await?;

        let addr = format!(
            "{}:{}",
            self.config.gateway.api_host, self.config.gateway.api_port
        );
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind API server to {addr}"))?;
        let bound = listener.local_addr()?;
        self.local_addr = Some(bound);

        let state = AppState {
            publisher: Arc::clone(&self.config.publisher),
            table: Arc::clone(&self.config.table),
            store: Arc::clone(&self.config.store),
            request_queue: self.config.request_queue.clone(),
            gateway: Arc::new(self.config.gateway.clone()),
            service: Arc::new(self.config.service.clone()),
        };
        let app = router::build_api_router(state);
        let shutdown = self.shutdown.clone();

        info!("API Server running at http://{bound}");
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!("API Server crashed: {}", e);
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server Interface shutting down...");
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.config.publisher.close().await;
        Ok(())
    }
}
