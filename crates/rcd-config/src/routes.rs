//! Routing model
//!
//! A routes file lists, per service identity, the route it consumes from and
//! the ordered routes it publishes to. Everything here is validated when the
//! file is loaded; nothing in this module performs bus I/O.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{error, info};

use crate::{ConfigError, ServiceKind};

/// Exchange types accepted by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeType {
    #[serde(rename = "fanout")]
    Fanout,
    #[serde(rename = "direct")]
    Direct,
    #[serde(rename = "topic")]
    Topic,
    #[serde(rename = "headers")]
    Headers,
    #[serde(rename = "x-delayed-message")]
    Delayed,
    #[serde(rename = "x-consistent-hash")]
    ConsistentHash,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Fanout => "fanout",
            ExchangeType::Direct => "direct",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
            ExchangeType::Delayed => "x-delayed-message",
            ExchangeType::ConsistentHash => "x-consistent-hash",
        }
    }
}

impl std::fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_auto_ack() -> bool {
    true
}

/// Route the service consumes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeRoute {
    pub exchange: String,
    #[serde(default)]
    pub routing_key: Option<String>,
    pub exchange_type: ExchangeType,
    #[serde(default = "default_auto_ack")]
    pub auto_ack: bool,
    pub queue_name: String,
}

impl ConsumeRoute {
    /// Binding key; an absent key binds with the queue name
    pub fn binding_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or(&self.queue_name)
    }
}

/// Route the service publishes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRoute {
    pub exchange: String,
    #[serde(default)]
    pub routing_key: Option<String>,
    pub exchange_type: ExchangeType,
    #[serde(default = "default_auto_ack")]
    pub auto_ack: bool,
    #[serde(default)]
    pub queue_name: Option<String>,
}

impl PublishRoute {
    pub fn new(exchange: &str, exchange_type: ExchangeType, routing_key: Option<&str>) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.map(str::to_string),
            exchange_type,
            auto_ack: true,
            queue_name: None,
        }
    }

    pub fn routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or("")
    }
}

/// Routes configured for one service identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRoutes {
    #[serde(default)]
    pub consume: Option<ConsumeRoute>,
    #[serde(default)]
    pub publish: Option<Vec<PublishRoute>>,
}

/// One record of the routes file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub service: String,
    pub routes: ServiceRoutes,
}

/// Routes resolved for the running service
#[derive(Debug, Clone)]
pub struct RoutingTable {
    pub service: String,
    pub kind: ServiceKind,
    pub consume: Option<ConsumeRoute>,
    pub publish: Vec<PublishRoute>,
}

impl RoutingTable {
    /// Load the routes file and resolve the entry for `service`
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        service: &str,
        kind: ServiceKind,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            error!(path = %path.display(), "Routes file does not exist");
            return Err(ConfigError::ValidationError(format!(
                "Routes file {} does not exist",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        let entries = parse_routes(&content)?;
        let table = Self::resolve(&entries, service, kind)?;
        info!(
            service = %table.service,
            kind = table.kind.as_str(),
            publish_routes = table.publish.len(),
            consumes = table.consume.is_some(),
            "Routes loaded"
        );
        Ok(table)
    }

    /// Pick the entry for `service` and check it fits the service kind
    pub fn resolve(
        entries: &[RouteEntry],
        service: &str,
        kind: ServiceKind,
    ) -> Result<Self, ConfigError> {
        let entry = entries
            .iter()
            .find(|e| e.service == service)
            .ok_or_else(|| ConfigError::MissingService(service.to_string()))?;

        let consume = if kind.consumes() {
            let route = entry.routes.consume.clone().ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "Service '{}' is a {} but has no consume route",
                    service,
                    kind.as_str()
                ))
            })?;
            Some(route)
        } else {
            None
        };

        let publish = match (&entry.routes.publish, kind.publishes()) {
            (Some(routes), _) => routes.clone(),
            (None, false) => Vec::new(),
            (None, true) => {
                return Err(ConfigError::ValidationError(format!(
                    "Service '{}' is a {} but has no publish routes",
                    service,
                    kind.as_str()
                )))
            }
        };

        Ok(Self {
            service: service.to_string(),
            kind,
            consume,
            publish,
        })
    }
}

/// Parse a JSON routes document
pub fn parse_routes(content: &str) -> Result<Vec<RouteEntry>, ConfigError> {
    Ok(serde_json::from_str(content)?)
}

/// Semantic role of a publish route, in routes-file order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteRole {
    ErrorNotification,
    ReceiptAck,
    SettingsResult,
    StatusResult,
}

impl RouteRole {
    pub const ALL: [RouteRole; 4] = [
        RouteRole::ErrorNotification,
        RouteRole::ReceiptAck,
        RouteRole::SettingsResult,
        RouteRole::StatusResult,
    ];

    pub fn index(&self) -> usize {
        match self {
            RouteRole::ErrorNotification => 0,
            RouteRole::ReceiptAck => 1,
            RouteRole::SettingsResult => 2,
            RouteRole::StatusResult => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteRole::ErrorNotification => "error-notification",
            RouteRole::ReceiptAck => "receipt-ack",
            RouteRole::SettingsResult => "settings-result",
            RouteRole::StatusResult => "status-result",
        }
    }
}

/// The four publish routes the dispatch handler needs, addressed by role
#[derive(Debug, Clone)]
pub struct PublishRoutes {
    routes: [PublishRoute; 4],
}

impl PublishRoutes {
    pub fn from_routes(routes: &[PublishRoute]) -> Result<Self, ConfigError> {
        match routes {
            [error, receipt, settings, status] => Ok(Self {
                routes: [
                    error.clone(),
                    receipt.clone(),
                    settings.clone(),
                    status.clone(),
                ],
            }),
            _ => {
                error!(count = routes.len(), "There are not all routes");
                Err(ConfigError::ValidationError(format!(
                    "Expected 4 publish routes (error, receipt, settings, status), got {}",
                    routes.len()
                )))
            }
        }
    }

    pub fn get(&self, role: RouteRole) -> &PublishRoute {
        &self.routes[role.index()]
    }
}
