use thiserror::Error;

/// Errors raised by the reader session, the status poller and the command executor
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The reader subsystem context could not be established
    #[error("Failed to establish PCSC context: {0}")]
    NoContext(String),

    /// Reader listing failed
    #[error("Failed to list readers: {0}")]
    EnumerationError(String),

    /// Zero readers were enumerated; the caller may rescan later
    #[error("No PCSC readers found")]
    NoReadersFound,

    /// The blocking status wait failed mid-loop
    #[error("Status wait failed: {0}")]
    StatusWaitError(String),

    /// The secondary status call used to read the ATR failed
    #[error("Failed to read status of reader '{reader}': {reason}")]
    StatusDetailError { reader: String, reason: String },

    /// Releasing the reader context failed
    #[error("Failed to release PCSC context: {0}")]
    ReleaseError(String),

    /// The operation was attempted on a handle that was never acquired or is already released
    #[error("Reader handle {0} is not valid")]
    InvalidHandle(u64),

    /// The poller thread could not be started
    #[error("Failed to start thread: {0}")]
    ThreadSpawn(String),

    /// The poller thread panicked; its session was released during unwind
    #[error("Status poller thread panicked")]
    PollerPanicked,

    /// External process spawn or output read failed
    #[error("Command I/O failed: {0}")]
    CommandIoError(String),

    /// The command request was rejected before it started
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// A request with the same correlation token is still running
    #[error("A command with token '{0}' is already in flight")]
    DuplicateToken(String),
}

impl MonitorError {
    /// Whether the error terminates the current reader session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            MonitorError::NoReadersFound
                | MonitorError::ReleaseError(_)
                | MonitorError::CommandIoError(_)
                | MonitorError::InvalidCommand(_)
                | MonitorError::DuplicateToken(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
