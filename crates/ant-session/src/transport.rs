use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Nothing arrived, or the device did not accept the write, in time.
    #[error("transport timed out")]
    Timeout,
    #[error("transport closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Byte stream to an ANT device, such as a USB bulk endpoint or a serial
/// port.
///
/// The session reads from one thread and writes from another, so both take
/// `&self`.
pub trait Transport: Send + Sync {
    /// Returns the bytes available, possibly several frames or a partial one.
    ///
    /// # Errors
    /// [`TransportError::Timeout`] when nothing arrives within `timeout`.
    fn read(&self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// # Errors
    /// [`TransportError::Timeout`] when the device does not accept `data`
    /// within `timeout`.
    fn write(&self, data: &[u8], timeout: Duration) -> Result<(), TransportError>;

    fn close(&self) {}
}
