//! Scheduled replication for `serve`
//!
//! Runs the configured job every interval until shutdown. A cycle interrupted by
//! shutdown leaves its checkpoint paused and the next start resumes it; a cycle
//! that ran to the end makes the following cycle fresh, so tags that moved at the
//! source since then are compared again.

use crate::error::Result;
use crate::logging::Logger;
use crate::replicator::{ReplicationOutcome, ReplicationRequest, TreeReplicator};
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSummary {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub last_outcome: Option<ReplicationOutcome>,
}

pub struct ReplicationService {
    replicator: TreeReplicator,
    request: ReplicationRequest,
    interval: Duration,
    output: Logger,
}

impl ReplicationService {
    pub fn new(
        replicator: TreeReplicator,
        request: ReplicationRequest,
        interval: Duration,
        output: Logger,
    ) -> Self {
        Self {
            replicator,
            request,
            interval,
            output,
        }
    }

    /// Run cycles until `cancel` fires
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ServiceSummary> {
        self.output.section("Replication service");
        self.output.info(&format!(
            "Replicating every {}",
            self.output.format_duration(self.interval)
        ));

        let mut summary = ServiceSummary::default();
        let mut fresh = self.request.fresh;

        while !cancel.is_cancelled() {
            summary.cycles += 1;
            self.output
                .subsection(&format!("Cycle {}", summary.cycles));

            let request = ReplicationRequest {
                fresh,
                ..self.request.clone()
            };
            match self.replicator.run(&request, cancel).await {
                Ok(report) => {
                    report.print(&self.output);
                    fresh = report.outcome != ReplicationOutcome::Paused;
                    summary.last_outcome = Some(report.outcome);
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    summary.failed_cycles += 1;
                    self.output
                        .error(&format!("Cycle {} failed: {}", summary.cycles, e));
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        self.output.info(&format!(
            "Replication service stopped after {} cycle(s)",
            summary.cycles
        ));
        Ok(summary)
    }
}

/// Cancel `cancel` on SIGINT or SIGTERM
pub async fn shutdown_signal(cancel: CancellationToken, output: Logger) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            output.warning(&format!("Failed to listen for Ctrl+C: {}", e));
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                output.warning(&format!("Failed to listen for SIGTERM: {}", e));
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => output.warning("Received SIGINT, finishing in-flight units"),
        _ = cancel.cancelled() => return,
        _ = terminate => output.warning("Received SIGTERM, finishing in-flight units"),
    }

    cancel.cancel();
}
