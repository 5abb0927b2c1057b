//! Common interface of decoder and encoder sessions.

use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::session::Session;
use crate::types::DeviceType;
use crate::Result;

/// Result of a read that did not fail.
#[derive(Debug)]
pub enum ReadOutcome<T> {
    /// A frame or packet was received.
    Data(T),
    /// The device has delivered everything after end of stream.
    EndOfStream,
    /// Nothing is ready yet; read again later.
    NoData,
}

impl<T> ReadOutcome<T> {
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// The received data, if any.
    pub fn data(self) -> Option<T> {
        match self {
            Self::Data(data) => Some(data),
            Self::EndOfStream | Self::NoData => None,
        }
    }
}

/// A session direction pair: something goes in, something comes out.
///
/// `write` and `read` may run on two different threads, but each must only
/// be called from one thread at a time.
pub trait SessionBackend: Send + Sync {
    type Input;
    type Output;

    fn session(&self) -> &Session;

    fn open(&self) -> Result<()>;

    /// Stop every session thread and close the device-side session.
    fn close(&self) -> Result<()>;

    /// Signal end of input; output keeps flowing until end of stream.
    fn flush(&self) -> Result<()>;

    /// Send one input unit. `Ok(0)` means the device had no room: send the
    /// same input again later.
    fn write(&self, input: &Self::Input) -> Result<usize>;

    fn read(&self) -> Result<ReadOutcome<Self::Output>>;

    fn device_type(&self) -> DeviceType {
        self.session().device_type()
    }
}

/// Read until end of stream, sleeping `idle` whenever nothing is ready.
///
/// Returns the number of outputs handed to `sink`.
pub fn drain<B>(backend: &B, idle: Duration, mut sink: impl FnMut(B::Output)) -> Result<usize>
where
    B: SessionBackend + ?Sized,
{
    let mut received = 0;
    loop {
        match backend.read()? {
            ReadOutcome::Data(output) => {
                received += 1;
                sink(output);
            }
            ReadOutcome::EndOfStream => {
                debug!(
                    "{} session {} drained after {} outputs",
                    backend.device_type(),
                    backend.session().session_id(),
                    received
                );
                return Ok(received);
            }
            ReadOutcome::NoData => thread::sleep(idle),
        }
    }
}
