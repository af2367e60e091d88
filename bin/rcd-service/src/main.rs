//! Remote Command Dispatcher Service
//!
//! Consumes job requests from the message bus, runs the requested Defender
//! command on every target host over remote PowerShell and publishes the
//! receipt, parsed results and errors to the configured routes.
//!
//! ## Service kinds
//!
//! - **consumer / all**: binds the consume route and dispatches jobs
//! - **publisher**: no inbound source, idles until a termination signal
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RCD_CONFIG` | search path | TOML configuration file |
//! | `RCD_SERVICE` | - | Service identity in the routes file (required) |
//! | `RCD_SERVICE_KIND` | `consumer` | `publisher`, `consumer` or `all` |
//! | `RCD_ROUTES_FILE` | `routes.json` | JSON routes file |
//! | `RCD_BROKER_HOST` | `localhost` | AMQP broker host |
//! | `RCD_BROKER_PORT` | `5672` | AMQP broker port |
//! | `RCD_MAX_CONCURRENT_COMMANDS` | `0` | Fan-out limit (0 = unbounded) |
//! | `RUST_LOG` | `log_level` | Log filter |
//! | `LOG_FORMAT` | text | `json` for structured output |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use rcd_common::logging::init_logging;
use rcd_common::TaskSupervisor;
use rcd_config::{ConfigLoader, PublishRoutes, RoutingTable};
use rcd_dispatch::{shutdown_signal, DispatchHandler, PwshRunner, ShutdownCoordinator};
use rcd_queue::amqp::AmqpBroker;
use rcd_queue::{Broker, MessageHandler};

#[derive(Parser, Debug)]
#[command(name = "rcd-service", version, about = "Message-driven remote command dispatcher")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short = 'C', long = "config", env = "RCD_CONFIG")]
    config: Option<PathBuf>,

    /// Service identity, as listed in the routes file
    #[arg(short = 's', long = "service", env = "RCD_SERVICE")]
    service: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("Failed to load configuration")?;

    init_logging("rcd-service", &config.log_level);
    info!(service = %args.service, kind = config.service.kind.as_str(), "Starting remote command dispatcher");

    let table = RoutingTable::from_file(&config.service.routes_file, &args.service, config.service.kind)
        .with_context(|| format!("Failed to load routes from {}", config.service.routes_file))?;
    let routes = PublishRoutes::from_routes(&table.publish).context("Invalid publish routes")?;

    let supervisor = Arc::new(TaskSupervisor::new());
    let broker = Arc::new(AmqpBroker::new(
        &config.broker,
        &table.service,
        table.consume.clone(),
        supervisor.clone(),
    ));
    let runner = Arc::new(PwshRunner::new(&config.handler));
    let handler: Arc<dyn MessageHandler> = Arc::new(DispatchHandler::new(
        broker.clone(),
        runner,
        routes,
        supervisor.clone(),
        &config.handler,
        &config.dispatch,
    ));

    if table.kind.consumes() {
        let consumer = broker.clone();
        let consume_handler = handler.clone();
        supervisor.spawn("consume-loop", async move {
            consumer
                .consume(consume_handler)
                .await
                .map_err(anyhow::Error::from)
        });
        info!("Consume loop started");
    } else {
        info!("Publisher service has no inbound source, waiting for a termination signal");
    }

    info!("Remote command dispatcher started");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let coordinator = ShutdownCoordinator::new(supervisor, broker, handler);
    let report = coordinator.shutdown().await;
    if report.failed > 0 {
        error!(failed = report.failed, "Some tasks failed before shutdown");
    }

    info!("Remote command dispatcher shutdown complete");
    Ok(())
}
