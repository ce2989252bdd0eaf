mod communicator;
mod error;
mod listener;
mod reading;
mod transport;

pub use communicator::{Communicator, CommunicatorConfig, MIN_POLL_INTERVAL};
pub use error::{Error, Result};
pub use listener::{BufferingListener, ChannelListener, Listener, StampedReading};
pub use reading::{decode, decode_at, parse_line, Reading, CM_PER_INCH, ECHO_US_PER_CM};
pub use transport::{SerialTransport, Transport, TransportError, LINE_DELIMITER, MAX_LINE_LEN};

use std::fmt;

/// Lifecycle of a [`Communicator`].
///
/// `Stopped` is terminal: once entered, no transition leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommunicatorState {
    Idle = 0x00,
    Reading = 0x01,
    Paused = 0x02,
    Stopped = 0x03,
}

impl CommunicatorState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0x00 => CommunicatorState::Idle,
            0x01 => CommunicatorState::Reading,
            0x02 => CommunicatorState::Paused,
            _ => CommunicatorState::Stopped,
        }
    }
}

impl fmt::Display for CommunicatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommunicatorState::Idle => "idle",
            CommunicatorState::Reading => "reading",
            CommunicatorState::Paused => "paused",
            CommunicatorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
