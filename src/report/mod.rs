use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use crate::event::ErrorEvent;
use crate::export::health::HealthMetrics;
use crate::publish::Sink;

/// Cause passed to an error reporter.
pub type Cause = dyn std::error::Error + Send + Sync;

/// Destination for per-instance failure reports.
pub trait ErrorReporter: Send + Sync {
    /// Report a failure for an instance. Best effort: callers only log a
    /// returned error.
    fn notify(
        &self,
        instance_id: &str,
        context: &str,
        cause: &Cause,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Publishes error records to a sink.
pub struct SinkErrorReporter<S> {
    sink: Arc<S>,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: Sink> SinkErrorReporter<S> {
    pub fn new(sink: Arc<S>, health: Option<Arc<HealthMetrics>>) -> Self {
        Self { sink, health }
    }
}

impl<S: Sink> ErrorReporter for SinkErrorReporter<S> {
    async fn notify(&self, instance_id: &str, context: &str, cause: &Cause) -> Result<()> {
        let event = ErrorEvent::new(instance_id, format!("{context}: {cause}"));
        let payload = event.encode()?;

        self.sink
            .publish(payload)
            .await
            .with_context(|| format!("publishing error report to {}", self.sink.name()))?;

        if let Some(health) = &self.health {
            health.errors_reported.inc();
        }

        Ok(())
    }
}

/// Sends a report and logs, rather than returns, a reporting failure.
pub async fn report_best_effort<R: ErrorReporter>(
    reporter: &R,
    instance_id: &str,
    context: &str,
    cause: &Cause,
) {
    if let Err(e) = reporter.notify(instance_id, context, cause).await {
        warn!(instance_id, context, error = %e, "failed to report error");
    }
}
