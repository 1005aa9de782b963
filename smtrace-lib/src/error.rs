use crate::report::EventKind;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),

    /// Invalid or inconsistent configuration value.
    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid cron expression {expr:?}: {source}")]
    Cron {
        expr: String,
        #[source]
        source: cron::error::Error,
    },

    /// A frame could not be decoded. Always local to the offending frame.
    #[error("decode failed at offset {offset}: {reason}")]
    Decode { offset: usize, reason: String },

    #[error("Not enough bytes")]
    NotEnoughData { actual: usize, minimum: usize },

    #[error("frame checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    Checksum { expected: u16, actual: u16 },

    /// A handler was given an event it does not declare as accepted.
    #[error("handler does not accept {got:?} events")]
    UnexpectedEvent { got: EventKind },

    #[error("smtp: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("mail address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("mail message: {0}")]
    Mail(#[from] lettre::error::Error),

    /// The reader thread could not be spawned or a lock was poisoned.
    #[error("{0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, Error>;
