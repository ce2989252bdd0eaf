use log::{debug, info};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read};
use std::time::{Duration, Instant};

pub const LINE_DELIMITER: u8 = b'\n';
pub const MAX_LINE_LEN: usize = 256;

const READ_CHUNK: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("timed out waiting for a line")]
    Timeout,
    #[error("transport is not open")]
    NotOpen,
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Line-oriented device connection driven by a communicator's worker.
///
/// All three operations are only ever called from the worker thread.
pub trait Transport: Send {
    fn open(&mut self, port: &str, baud_rate: u32, timeout: Duration)
        -> Result<(), TransportError>;

    /// Blocks for at most the timeout given to `open`. The returned line
    /// includes its delimiter.
    fn read_line(&mut self) -> Result<Vec<u8>, TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;
}

/// Serial port transport, 8N1 without flow control.
#[derive(Default)]
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    timeout: Duration,
    pending: Vec<u8>,
    /// Set after an overlong line until its delimiter has gone by.
    discarding: bool,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a port that is already open and configured; `open` leaves it as is.
    pub fn from_port(port: Box<dyn SerialPort>, timeout: Duration) -> Self {
        Self {
            port: Some(port),
            timeout,
            ..Self::default()
        }
    }
}

impl Transport for SerialTransport {
    fn open(
        &mut self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }
        let serial = serialport::new(port, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|source| TransportError::Open {
                port: port.to_string(),
                source,
            })?;
        info!("Opened serial port {port} at {baud_rate} baud");
        self.port = Some(serial);
        self.timeout = timeout;
        self.pending.clear();
        self.discarding = false;
        Ok(())
    }

    fn read_line(&mut self) -> Result<Vec<u8>, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        let deadline = Instant::now() + self.timeout;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            while let Some(line) = take_line(&mut self.pending) {
                if self.discarding {
                    debug!("Discarded tail of overlong line ({} bytes)", line.len());
                    self.discarding = false;
                    continue;
                }
                // content plus delimiter
                if line.len() > MAX_LINE_LEN + 1 {
                    return Err(TransportError::LineTooLong {
                        limit: MAX_LINE_LEN,
                    });
                }
                return Ok(line);
            }
            if self.pending.len() > MAX_LINE_LEN {
                self.pending.clear();
                if !self.discarding {
                    self.discarding = true;
                    return Err(TransportError::LineTooLong {
                        limit: MAX_LINE_LEN,
                    });
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            port.set_timeout(deadline - now).map_err(io::Error::from)?;
            match port.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Timeout),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(TransportError::Timeout)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let port = self.port.take().ok_or(TransportError::NotOpen)?;
        if !self.pending.is_empty() {
            debug!("Dropping {} bytes of partial line", self.pending.len());
            self.pending.clear();
        }
        self.discarding = false;
        info!("Closed serial port {}", port.name().unwrap_or_default());
        Ok(())
    }
}

/// Splits the first complete line, delimiter included, off the front of `buffer`.
fn take_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let end = buffer.iter().position(|&b| b == LINE_DELIMITER)?;
    Some(buffer.drain(..=end).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_line_keeps_partial_tail() {
        let mut buffer = b"12\r\n34\n5".to_vec();
        assert_eq!(take_line(&mut buffer).unwrap(), b"12\r\n");
        assert_eq!(take_line(&mut buffer).unwrap(), b"34\n");
        assert_eq!(take_line(&mut buffer), None);
        assert_eq!(buffer, b"5");
    }

    #[test]
    fn take_line_on_empty_buffer() {
        let mut buffer = Vec::new();
        assert_eq!(take_line(&mut buffer), None);
    }

    #[test]
    fn unopened_serial_transport_refuses_io() {
        let mut transport = SerialTransport::new();
        assert!(matches!(transport.read_line(), Err(TransportError::NotOpen)));
        assert!(matches!(transport.close(), Err(TransportError::NotOpen)));
    }

    #[test]
    fn open_reports_missing_port() {
        let mut transport = SerialTransport::new();
        let result = transport.open("/dev/does-not-exist-sonar", 9600, Duration::from_millis(10));
        match result {
            Err(TransportError::Open { port, .. }) => assert_eq!(port, "/dev/does-not-exist-sonar"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(()) => panic!("opened a port that does not exist"),
        }
    }

    #[cfg(unix)]
    mod pty {
        use super::super::*;
        use crate::sens::parse_line;
        use serialport::TTYPort;
        use std::io::Write;
        use std::thread;

        /// Device end of a pseudo terminal and a transport reading the other end.
        fn pair(timeout: Duration) -> (TTYPort, SerialTransport) {
            let (device, host) = TTYPort::pair().expect("pseudo terminal pair");
            (device, SerialTransport::from_port(Box::new(host), timeout))
        }

        fn line_of(len: usize) -> Vec<u8> {
            let mut line = vec![b'1'; len];
            line.push(LINE_DELIMITER);
            line
        }

        #[test]
        fn joins_a_line_split_across_writes() {
            let (mut device, mut transport) = pair(Duration::from_secs(2));
            device.write_all(b"12").unwrap();
            let writer = thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                device.write_all(b"34\n").unwrap();
                device
            });
            assert_eq!(transport.read_line().unwrap(), b"1234\n");
            writer.join().unwrap();
        }

        #[test]
        fn accepts_line_at_length_limit() {
            let (mut device, mut transport) = pair(Duration::from_secs(2));
            let line = line_of(MAX_LINE_LEN);
            device.write_all(&line).unwrap();
            assert_eq!(transport.read_line().unwrap(), line);
        }

        #[test]
        fn rejects_line_one_byte_over_limit() {
            let (mut device, mut transport) = pair(Duration::from_secs(2));
            device.write_all(&line_of(MAX_LINE_LEN + 1)).unwrap();
            device.write_all(b"58\n").unwrap();
            assert!(matches!(
                transport.read_line(),
                Err(TransportError::LineTooLong { limit: MAX_LINE_LEN })
            ));
            assert_eq!(transport.read_line().unwrap(), b"58\n");
        }

        #[test]
        fn tail_of_long_line_is_never_returned() {
            let (mut device, mut transport) = pair(Duration::from_secs(2));
            device.write_all(&line_of(400)).unwrap();
            device.write_all(b"58\n").unwrap();
            assert!(matches!(
                transport.read_line(),
                Err(TransportError::LineTooLong { .. })
            ));
            let next = transport.read_line().unwrap();
            assert_eq!(next, b"58\n");
            assert_eq!(parse_line(&next).unwrap(), 58.0);
        }

        #[test]
        fn silent_device_times_out() {
            let (_device, mut transport) = pair(Duration::from_millis(50));
            let started = Instant::now();
            assert!(matches!(transport.read_line(), Err(TransportError::Timeout)));
            assert!(started.elapsed() >= Duration::from_millis(40));
        }

        #[test]
        fn trickling_bytes_do_not_stretch_the_timeout() {
            let (mut device, mut transport) = pair(Duration::from_millis(200));
            let writer = thread::spawn(move || {
                device.write_all(b"1").unwrap();
                thread::sleep(Duration::from_millis(150));
                device.write_all(b"2").unwrap();
                device
            });
            let started = Instant::now();
            assert!(matches!(transport.read_line(), Err(TransportError::Timeout)));
            assert!(started.elapsed() < Duration::from_millis(300), "{:?}", started.elapsed());
            writer.join().unwrap();
        }
    }
}
