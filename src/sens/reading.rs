use super::{Error, Result};
use std::fmt;
use std::time::Duration;

/// Echo round-trip time, in microseconds, for one centimeter of distance.
/// The pulse travels out and back, so the raw value is halved as well.
pub const ECHO_US_PER_CM: f64 = 29.0;
pub const CM_PER_INCH: f64 = 2.54;

/// One decoded measurement from an ultrasonic ranger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Value as received from the device.
    pub raw: f64,
    pub centimeters: f64,
    /// Time since the previous successful reading, zero for the first.
    pub elapsed: Duration,
    /// Time since the first successful reading on the same communicator.
    pub since_first: Duration,
}

impl Reading {
    pub fn inches(&self) -> f64 {
        self.centimeters / CM_PER_INCH
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Time: {:.3} | Centimeters: {} | Raw: {}",
            self.since_first.as_secs_f64(),
            self.centimeters,
            self.raw
        )
    }
}

pub fn decode(raw: f64, elapsed: Duration) -> Reading {
    decode_at(raw, elapsed, elapsed)
}

/// Builds a [`Reading`] with an explicit running time stamp.
///
/// Zero and negative raw values pass straight through the arithmetic; judging
/// physical plausibility is up to the listener.
pub fn decode_at(raw: f64, elapsed: Duration, since_first: Duration) -> Reading {
    Reading {
        raw,
        centimeters: raw / ECHO_US_PER_CM / 2.0,
        elapsed,
        since_first,
    }
}

/// Parses one device line (ASCII decimal, integer or float) into a raw value.
pub fn parse_line(line: &[u8]) -> Result<f64> {
    let decode_error = || Error::Decode {
        line: String::from_utf8_lossy(line).into_owned(),
    };
    let text = std::str::from_utf8(line).map_err(|_| decode_error())?;
    let value = text.trim().parse::<f64>().map_err(|_| decode_error())?;
    if !value.is_finite() {
        return Err(decode_error());
    }
    Ok(value)
}
