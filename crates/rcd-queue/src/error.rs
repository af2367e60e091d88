use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Which part of the transport a fault invalidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Connection and channel are both unusable
    Connection,
    /// Only the channel is unusable
    Channel,
    /// Operation failed, transport state unaffected
    Other,
}

impl QueueError {
    pub fn fault_class(&self) -> FaultClass {
        match self {
            QueueError::Connection(_) => FaultClass::Connection,
            QueueError::Channel(_) => FaultClass::Channel,
            _ => FaultClass::Other,
        }
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for QueueError {
    fn from(e: lapin::Error) -> Self {
        match classify(&e) {
            FaultClass::Connection => QueueError::Connection(e.to_string()),
            FaultClass::Channel => QueueError::Channel(e.to_string()),
            FaultClass::Other => QueueError::Broker(e.to_string()),
        }
    }
}

/// Sort a lapin error into the part of the transport it invalidates.
///
/// AMQP hard errors close the connection, soft errors close only the channel.
#[cfg(feature = "amqp")]
pub fn classify(e: &lapin::Error) -> FaultClass {
    use lapin::protocol::AMQPErrorKind;

    match e {
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => FaultClass::Connection,
        lapin::Error::InvalidChannel(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::ChannelsLimitReached => FaultClass::Channel,
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Hard(_) => FaultClass::Connection,
            AMQPErrorKind::Soft(_) => FaultClass::Channel,
        },
        _ => FaultClass::Other,
    }
}
