//! AMQP connection and channel management
//!
//! One connection and one channel are shared by the consume loop and every
//! publisher. Both are opened lazily and reopened after a fault has been
//! reported through [`ConnectionManager::report_fault`].

use lapin::{options::BasicQosOptions, Channel, Connection, ConnectionProperties};
use parking_lot::RwLock;
use rcd_config::BrokerConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::state::{ConnectionEvent, ConnectionState};
use crate::{FaultClass, QueueError, Result};

/// Connection parameters derived from the broker configuration
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub uri: String,
    pub connection_name: String,
    pub prefetch_count: u16,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &BrokerConfig, connection_name: &str) -> Self {
        Self {
            uri: config.uri(),
            connection_name: connection_name.to_string(),
            prefetch_count: config.prefetch_count,
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    state: RwLock<ConnectionState>,
    attempts: AtomicU64,
    // Lock order: connection before channel
    connection: Mutex<Option<Connection>>,
    channel: Mutex<Option<Channel>>,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            state: RwLock::new(ConnectionState::Disconnected),
            attempts: AtomicU64::new(0),
            connection: Mutex::new(None),
            channel: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Connection attempts made since the manager was created
    pub fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    fn apply(&self, event: ConnectionEvent) -> ConnectionState {
        let mut state = self.state.write();
        let next = state.on(event);
        if next != *state {
            debug!(from = state.as_str(), to = next.as_str(), ?event, "Connection state changed");
        }
        *state = next;
        next
    }

    /// Make sure a live connection exists, retrying forever with a fixed delay
    pub async fn ensure_connection(&self) {
        let mut conn_guard = self.connection.lock().await;

        if let Some(conn) = conn_guard.as_ref() {
            if conn.status().connected() && self.state().is_connected() {
                return;
            }
            warn!("Error: there is no active connection.");
            self.apply(ConnectionEvent::ConnectionFault);
            *conn_guard = None;
            self.channel.lock().await.take();
        }

        loop {
            self.apply(ConnectionEvent::Connecting);
            let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
            info!(attempt, "Starting to set up new connection.");

            match self.open_connection().await {
                Ok(conn) => {
                    *conn_guard = Some(conn);
                    self.apply(ConnectionEvent::Connected);
                    info!("Connection was set up");
                    return;
                }
                Err(e) => {
                    self.apply(ConnectionEvent::ConnectionFault);
                    error!(
                        error = %e,
                        retry_in_secs = self.settings.reconnect_delay.as_secs(),
                        "Setting up connection was failed"
                    );
                    tokio::time::sleep(self.settings.reconnect_delay).await;
                }
            }
        }
    }

    async fn open_connection(&self) -> Result<Connection> {
        let connect = Connection::connect(
            &self.settings.uri,
            ConnectionProperties::default()
                .with_connection_name(self.settings.connection_name.clone().into()),
        );

        match tokio::time::timeout(self.settings.connect_timeout, connect).await {
            Ok(result) => result.map_err(QueueError::from),
            Err(_) => Err(QueueError::Connection(format!(
                "connect timed out after {}s",
                self.settings.connect_timeout.as_secs()
            ))),
        }
    }

    /// Make sure a live channel exists on the current connection.
    ///
    /// Returns `None` when there is no connection or the channel could not be
    /// opened; the fault has then been logged and recorded.
    pub async fn ensure_channel(&self) -> Option<Channel> {
        let mut conn_guard = self.connection.lock().await;
        let mut chan_guard = self.channel.lock().await;

        if let Some(channel) = chan_guard.as_ref() {
            if channel.status().connected() && self.state().is_channel_ready() {
                return Some(channel.clone());
            }
            warn!("Error: there is no active channel.");
            self.apply(ConnectionEvent::ChannelFault);
            *chan_guard = None;
        }

        let opened = match conn_guard.as_ref() {
            Some(conn) => {
                info!("Starting to set up new channel.");
                Self::open_channel(conn, self.settings.prefetch_count).await
            }
            None => return None,
        };

        match opened {
            Ok(channel) => {
                *chan_guard = Some(channel.clone());
                self.apply(ConnectionEvent::ChannelOpened);
                info!(prefetch = self.settings.prefetch_count, "Channel was set up");
                Some(channel)
            }
            Err(e) => {
                error!(error = %e, "Setting up channel was failed");
                if e.fault_class() == FaultClass::Connection {
                    self.apply(ConnectionEvent::ConnectionFault);
                    *conn_guard = None;
                } else {
                    self.apply(ConnectionEvent::ChannelFault);
                }
                None
            }
        }
    }

    async fn open_channel(conn: &Connection, prefetch_count: u16) -> Result<Channel> {
        let channel = conn.create_channel().await?;
        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(channel)
    }

    /// Connection (retrying until it succeeds) plus channel
    pub async fn channel(&self) -> Option<Channel> {
        self.ensure_connection().await;
        self.ensure_channel().await
    }

    /// Record a fault so the next caller reopens what it invalidated
    pub async fn report_fault(&self, err: &QueueError) {
        match err.fault_class() {
            FaultClass::Connection => {
                error!(error = %err, "Connection exception");
                let mut conn_guard = self.connection.lock().await;
                self.apply(ConnectionEvent::ConnectionFault);
                *conn_guard = None;
                self.channel.lock().await.take();
            }
            FaultClass::Channel => {
                error!(error = %err, "Channel exception");
                let mut chan_guard = self.channel.lock().await;
                self.apply(ConnectionEvent::ChannelFault);
                *chan_guard = None;
            }
            FaultClass::Other => {
                error!(error = %err, "Broker operation failed");
            }
        }
    }

    /// Close the connection if one is open. Safe to call repeatedly.
    pub async fn close(&self) {
        let mut conn_guard = self.connection.lock().await;
        let channel = self.channel.lock().await.take();

        if let Some(channel) = channel {
            if channel.status().connected() {
                if let Err(e) = channel.close(200, "Shutdown").await {
                    debug!(error = %e, "Channel close failed");
                }
            }
        }

        if let Some(conn) = conn_guard.take() {
            if conn.status().connected() {
                if let Err(e) = conn.close(200, "Shutdown").await {
                    warn!(error = %e, "Connection close failed");
                }
            }
            info!("Connection has been closed");
        }

        self.apply(ConnectionEvent::Closed);
    }
}
