//! Inbound job requests and the outbound messages they produce

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DispatchError, Result};
use crate::event::Event;
use crate::parser::PreferenceRecord;

#[derive(Debug, Deserialize)]
struct RawJob {
    hostnames: Vec<String>,
    task_id: i64,
    event: String,
    #[serde(default)]
    preferences: Option<Map<String, Value>>,
}

/// A decoded and validated job. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub hostnames: Vec<String>,
    pub task_id: i64,
    pub event: Event,
    pub preferences: Map<String, Value>,
}

impl JobRequest {
    /// Decode a delivery body
    pub fn decode(body: &[u8]) -> Result<Self> {
        let raw: RawJob = serde_json::from_slice(body)?;

        if raw.hostnames.is_empty() {
            return Err(DispatchError::InvalidRequest("hostnames is empty".to_string()));
        }
        let event = raw.event.parse::<Event>()?;

        Ok(Self {
            hostnames: raw.hostnames,
            task_id: raw.task_id,
            event,
            preferences: raw.preferences.unwrap_or_default(),
        })
    }
}

/// Published on the receipt route before any host is contacted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptAck {
    pub task_id: i64,
}

/// Published on the error route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotification {
    pub host_ip: String,
    pub message: String,
    pub category: String,
}

impl ErrorNotification {
    pub fn new(host: &str, detail: impl std::fmt::Display, category: &str) -> Self {
        Self {
            host_ip: host.to_string(),
            message: format!("Invoke PowerShell command error. {}", detail),
            category: category.to_string(),
        }
    }
}

/// Published on the settings or status route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceReport {
    pub host_ip: String,
    pub preferences: Vec<PreferenceRecord>,
}
