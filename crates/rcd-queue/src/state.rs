//! Connection state machine
//!
//! The connection manager owns one [`ConnectionState`] and moves it only by
//! feeding [`ConnectionEvent`]s through [`ConnectionState::on`]. Everyone else
//! reads it.

/// Where the bus connection currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ChannelReady,
}

/// Something that happened to the connection or channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection attempt started
    Connecting,
    /// The connection is open
    Connected,
    /// A channel was opened (and QoS applied) on the open connection
    ChannelOpened,
    /// A channel-level fault; the connection itself is still usable
    ChannelFault,
    /// A connection-level fault; connection and channel are both gone
    ConnectionFault,
    /// The connection was closed on purpose
    Closed,
}

impl ConnectionState {
    /// Next state after `event`. Events that make no sense in the current
    /// state leave it unchanged.
    pub fn on(self, event: ConnectionEvent) -> Self {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self, event) {
            (_, E::ConnectionFault) | (_, E::Closed) => S::Disconnected,
            (S::Disconnected, E::Connecting) => S::Connecting,
            (S::Disconnected | S::Connecting, E::Connected) => S::Connected,
            (S::Connected, E::ChannelOpened) => S::ChannelReady,
            (S::ChannelReady, E::ChannelFault) => S::Connected,
            (state, _) => state,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::ChannelReady)
    }

    pub fn is_channel_ready(&self) -> bool {
        matches!(self, ConnectionState::ChannelReady)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ChannelReady => "channel-ready",
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}
