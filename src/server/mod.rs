//! HTTP server for push adapters.
//!
//! # Endpoints
//!
//! - `POST /webhook/github` - GitHub webhook deliveries (202 Accepted)
//! - `POST /webhook/terraform` - Terraform Cloud notifications (202 Accepted)
//! - `GET /healthz` - Returns 200 `ok` while the server is running
//!
//! A full queue is answered with 503 so the sender retries later.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::pipeline::{EventSink, RunningSource, Source, SourceError};

pub mod health;
pub mod webhook;

pub use health::health_handler;
pub use webhook::{WebhookError, github_webhook_handler, terraform_webhook_handler};

/// Shared application state, passed to handlers via Axum's `State`
/// extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    sink: EventSink,

    /// HMAC-SHA256 secret for GitHub. Empty disables verification.
    github_secret: Vec<u8>,

    /// HMAC-SHA512 secret for Terraform Cloud. Empty disables
    /// verification.
    tfc_secret: Vec<u8>,
}

impl AppState {
    pub fn new(
        sink: EventSink,
        github_secret: impl Into<Vec<u8>>,
        tfc_secret: impl Into<Vec<u8>>,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                sink,
                github_secret: github_secret.into(),
                tfc_secret: tfc_secret.into(),
            }),
        }
    }

    pub fn sink(&self) -> &EventSink {
        &self.inner.sink
    }

    pub fn github_secret(&self) -> &[u8] {
        &self.inner.github_secret
    }

    pub fn tfc_secret(&self) -> &[u8] {
        &self.inner.tfc_secret
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/webhook/github", post(github_webhook_handler))
        .route("/webhook/terraform", post(terraform_webhook_handler))
        .route("/healthz", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// The webhook listener as a pipeline [`Source`].
///
/// The socket is bound inside [`Source::start`], so an address already in
/// use fails the pipeline start instead of surfacing later.
pub struct WebhookServer {
    addr: SocketAddr,
    github_secret: String,
    tfc_secret: String,
}

impl WebhookServer {
    pub fn new(addr: SocketAddr) -> Self {
        WebhookServer {
            addr,
            github_secret: String::new(),
            tfc_secret: String::new(),
        }
    }

    pub fn with_github_secret(mut self, secret: impl Into<String>) -> Self {
        self.github_secret = secret.into();
        self
    }

    pub fn with_tfc_secret(mut self, secret: impl Into<String>) -> Self {
        self.tfc_secret = secret.into();
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn bind(&self) -> Result<tokio::net::TcpListener, SourceError> {
        let bind_error = |source| SourceError::Bind {
            addr: self.addr.to_string(),
            source,
        };
        let listener = std::net::TcpListener::bind(self.addr).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        tokio::net::TcpListener::from_std(listener).map_err(bind_error)
    }
}

impl Source for WebhookServer {
    fn name(&self) -> &str {
        "webhooks"
    }

    fn start(
        self: Box<Self>,
        sink: EventSink,
        shutdown: CancellationToken,
    ) -> Result<RunningSource, SourceError> {
        let listener = self.bind()?;
        let local_addr = listener.local_addr().unwrap_or(self.addr);

        if self.github_secret.is_empty() {
            warn!("No GitHub webhook secret configured, signature validation disabled");
        }
        if self.tfc_secret.is_empty() {
            warn!("No Terraform Cloud webhook secret configured, signature validation disabled");
        }

        let app = build_router(AppState::new(
            sink,
            self.github_secret.into_bytes(),
            self.tfc_secret.into_bytes(),
        ));
        info!(addr = %local_addr, "Webhook server listening");

        Ok(RunningSource::spawn("webhooks", &shutdown, move |stop| async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await;
            if let Err(e) = served {
                error!(error = %e, "Webhook server failed");
            }
        }))
    }
}
