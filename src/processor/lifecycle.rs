//! Run-scoped handles for `Consumer`: the run token, the fatal error handler
//! and the metrics reporter.

use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::{self, Telemetry};
use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) struct LifecycleHandles {
    pub run_token: CancellationToken,
    fatal_handler: Arc<FatalErrorHandler>,
    metrics_handle: Option<JoinHandle<()>>,
}

impl LifecycleHandles {
    pub(crate) fn spawn(
        shutdown_root: &CancellationToken,
        telemetry: Arc<Telemetry>,
        metrics_interval: Duration,
    ) -> Self {
        let run_token = shutdown_root.child_token();
        let fatal_handler = Arc::new(FatalErrorHandler::new(
            shutdown_root.clone(),
            run_token.clone(),
        ));
        let metrics_handle =
            telemetry::spawn_metrics_reporter(telemetry, run_token.clone(), metrics_interval);

        Self {
            run_token,
            fatal_handler,
            metrics_handle: Some(metrics_handle),
        }
    }

    pub(crate) fn fatal_handler(&self) -> Arc<FatalErrorHandler> {
        self.fatal_handler.clone()
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.fatal_handler.error()
    }

    /// Cancels the run token and joins the background tasks.
    pub(crate) async fn shutdown(mut self) {
        self.run_token.cancel();
        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }
    }
}
