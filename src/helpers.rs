use std::{future::Future, pin::Pin};

use axum::{http::StatusCode, response::IntoResponse};
use futures::future;
use tokio::signal;
use tracing::{error, info};

pub async fn handler_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "404 page not found")
}

/// Resolves on ctrl+c or SIGTERM.
pub async fn do_shutdown() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to listen for ctrl+c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {}", err);
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

    info!("starting graceful shutdown...");
}

/// Cleanup work run together once the server has stopped.
pub struct Closer {
    closers: Vec<(&'static str, Pin<Box<dyn Future<Output = ()> + Send + 'static>>)>,
}

impl Closer {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            closers: Vec::new(),
        }
    }

    pub fn add<F>(&mut self, name: &'static str, f: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.closers.push((name, Box::pin(f)));
    }

    pub async fn close(self) {
        future::join_all(self.closers.into_iter().map(|(name, f)| async move {
            f.await;
            info!("closed {}", name);
        }))
        .await;
    }
}
