//! Dispatch orchestrator
//!
//! Decodes a job, publishes the receipt, then fans the job out as one
//! supervised task per hostname. Each host task validates the preferences,
//! runs the command and routes the outcome.

use async_trait::async_trait;
use rcd_common::TaskSupervisor;
use rcd_config::{DispatchConfig, HandlerConfig, PublishRoutes, RouteRole};
use rcd_queue::{MessageHandler, Publisher};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{DispatchError, Result};
use crate::job::{ErrorNotification, JobRequest, PreferenceReport, ReceiptAck};
use crate::parser;
use crate::runner::{CommandOutput, CommandRunner};

/// Everything a host task needs, shared by all of them
struct Dispatcher {
    publisher: Arc<dyn Publisher>,
    runner: Arc<dyn CommandRunner>,
    routes: PublishRoutes,
    error_category: String,
    limiter: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    async fn publish<T: Serialize>(&self, message: &T, role: RouteRole) {
        match serde_json::to_value(message) {
            Ok(body) => {
                debug!(route = role.as_str(), "Publishing");
                self.publisher.publish(&body, self.routes.get(role)).await;
            }
            Err(e) => error!(error = %e, route = role.as_str(), "Failed to serialize message"),
        }
    }

    async fn publish_error(&self, host: &str, detail: impl std::fmt::Display) {
        let notification = ErrorNotification::new(host, detail, &self.error_category);
        self.publish(&notification, RouteRole::ErrorNotification).await;
    }

    /// Validate and invoke, holding a command slot when a limit is set
    async fn invoke(&self, job: &JobRequest, host: &str) -> Result<CommandOutput> {
        let _permit = match &self.limiter {
            Some(limiter) => Some(
                Arc::clone(limiter)
                    .acquire_owned()
                    .await
                    .map_err(|_| DispatchError::Runner("dispatcher is stopped".to_string()))?,
            ),
            None => None,
        };

        let command = job.event.command();
        let args = job.event.schema().validate(command, &job.preferences)?;
        self.runner.invoke(host, command, &args).await
    }

    async fn process_host(&self, job: &JobRequest, host: &str) -> Result<()> {
        let output = match self.invoke(job, host).await {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "Error: invoke PowerShell command");
                self.publish_error(host, &e).await;
                return Err(e);
            }
        };

        if !output.stdout.is_empty() {
            if let Some(role) = job.event.result_role() {
                let report = PreferenceReport {
                    host_ip: host.to_string(),
                    preferences: parser::parse(&output.stdout, job.event),
                };
                info!(records = report.preferences.len(), route = role.as_str(), "Publishing command result");
                self.publish(&report, role).await;
            }
        }

        // Single characters are treated as noise
        if output.stderr.chars().count() > 1 {
            warn!(stderr = %output.stderr.trim(), "Command wrote to stderr");
            self.publish_error(host, &output.stderr).await;
        }

        Ok(())
    }
}

pub struct DispatchHandler {
    dispatcher: Arc<Dispatcher>,
    supervisor: Arc<TaskSupervisor>,
}

impl DispatchHandler {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        runner: Arc<dyn CommandRunner>,
        routes: PublishRoutes,
        supervisor: Arc<TaskSupervisor>,
        handler: &HandlerConfig,
        dispatch: &DispatchConfig,
    ) -> Self {
        let limiter = dispatch.command_limit().map(|n| Arc::new(Semaphore::new(n)));
        info!(
            command_limit = ?dispatch.command_limit(),
            category = %handler.error_category(),
            "PowerShell handler was prepared."
        );

        Self {
            dispatcher: Arc::new(Dispatcher {
                publisher,
                runner,
                routes,
                error_category: handler.error_category(),
                limiter,
            }),
            supervisor,
        }
    }

    /// Publish the receipt and start one task per host
    async fn dispatch(&self, job: JobRequest) {
        info!(hosts = job.hostnames.len(), "Job accepted");
        self.dispatcher
            .publish(&ReceiptAck { task_id: job.task_id }, RouteRole::ReceiptAck)
            .await;

        let job = Arc::new(job);
        for host in job.hostnames.iter().cloned() {
            let dispatcher = Arc::clone(&self.dispatcher);
            let task_job = Arc::clone(&job);
            let span = info_span!("host", host = %host);
            let name = format!("dispatch-{}-{}", job.task_id, host);

            let accepted = self.supervisor.spawn(
                name,
                async move {
                    dispatcher
                        .process_host(&task_job, &host)
                        .await
                        .map_err(anyhow::Error::from)
                }
                .instrument(span),
            );
            if !accepted {
                warn!("Shutting down, remaining hosts were not dispatched");
                break;
            }
        }
    }
}

#[async_trait]
impl MessageHandler for DispatchHandler {
    async fn handle(&self, body: Vec<u8>) {
        let job = match JobRequest::decode(&body) {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "Error: could not load json body");
                return;
            }
        };

        let span = info_span!("job", task_id = job.task_id, event = %job.event);
        self.dispatch(job).instrument(span).await;
    }

    async fn stop_handler(&self) {
        if let Some(limiter) = &self.dispatcher.limiter {
            limiter.close();
        }
        info!("PowerShell handler has been closed.");
    }
}
