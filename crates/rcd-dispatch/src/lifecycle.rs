//! Shutdown coordination
//!
//! Order matters: every supervised task is cancelled and settled before the
//! bus is stopped, so no publish can reach a closed connection. The handler
//! releases its resources last.

use rcd_common::{TaskReport, TaskSupervisor};
use rcd_queue::{Broker, MessageHandler};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

pub struct ShutdownCoordinator {
    supervisor: Arc<TaskSupervisor>,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn MessageHandler>,
}

impl ShutdownCoordinator {
    pub fn new(
        supervisor: Arc<TaskSupervisor>,
        broker: Arc<dyn Broker>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            supervisor,
            broker,
            handler,
        }
    }

    /// Cancel and settle all tasks, then stop the bus and the handler
    pub async fn shutdown(&self) -> TaskReport {
        info!(in_flight = self.supervisor.in_flight(), "Shutting down");

        let report = self.supervisor.shutdown().await;
        info!(
            completed = report.completed,
            failed = report.failed,
            cancelled = report.cancelled,
            "All tasks settled"
        );

        self.broker.stop().await;
        self.handler.stop_handler().await;

        info!("Shutdown complete");
        report
    }
}

/// Resolves on SIGINT, SIGTERM or SIGHUP
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = unix_signal(signal::unix::SignalKind::terminate());

    #[cfg(unix)]
    let hangup = unix_signal(signal::unix::SignalKind::hangup());

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
        _ = hangup => info!("Received SIGHUP"),
    }
}

#[cfg(unix)]
async fn unix_signal(kind: signal::unix::SignalKind) {
    match signal::unix::signal(kind) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            error!(error = %e, "Failed to install signal handler");
            std::future::pending::<()>().await;
        }
    }
}
