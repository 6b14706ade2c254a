//! Point-to-point serial transport
//!
//! One transport per device. The port is opened lazily (or eagerly at
//! startup), held for the life of the process and closed on drop. Sends are
//! serialized by a lock held for the whole frame, so frames from concurrent
//! callers never interleave on the line.

use super::port::{PortConfig, SerialConnection};
use crate::error::TransportError;
use log::{debug, error, info, warn};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Default number of retries after a failed write
pub const DEFAULT_RETRIES: u32 = 2;

/// Something a frame can be written to
pub trait Link: Send {
    /// Write and flush one complete frame
    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;
}

/// Opens links; the serial implementation opens a port, tests hand out
/// in-memory recorders
pub trait Connector: Send + Sync {
    fn port(&self) -> &str;
    fn connect(&self) -> Result<Box<dyn Link>, TransportError>;
}

impl Link for SerialConnection {
    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.write_all(frame)
    }
}

/// Connector backed by a real serial port
pub struct SerialConnector {
    config: PortConfig,
}

impl SerialConnector {
    pub fn new(config: PortConfig) -> Self {
        Self { config }
    }
}

impl Connector for SerialConnector {
    fn port(&self) -> &str {
        &self.config.port_path
    }

    fn connect(&self) -> Result<Box<dyn Link>, TransportError> {
        let mut conn = SerialConnection::open(self.config.clone())?;
        if let Err(e) = conn.clear_buffers() {
            debug!("Could not clear buffers on {}: {}", self.config.port_path, e);
        }
        let opened = conn.config();
        info!(
            "Opened {} at {} baud ({:?} parity, {:?} stop bits)",
            opened.port_path, opened.baud_rate, opened.parity, opened.stop_bits
        );
        Ok(Box::new(conn))
    }
}

struct LinkState {
    link: Option<Box<dyn Link>>,
    closed: bool,
}

/// Serialized, retrying writer for one device
pub struct SerialTransport {
    name: String,
    connector: Box<dyn Connector>,
    state: Mutex<LinkState>,
    retries: u32,
    retry_delay: Duration,
}

impl SerialTransport {
    pub fn new(name: &str, connector: Box<dyn Connector>) -> Self {
        Self {
            name: name.to_string(),
            connector,
            state: Mutex::new(LinkState {
                link: None,
                closed: false,
            }),
            retries: DEFAULT_RETRIES,
            retry_delay: Duration::from_millis(200),
        }
    }

    /// Transport over a real serial port
    pub fn serial(name: &str, config: PortConfig) -> Self {
        Self::new(name, Box::new(SerialConnector::new(config)))
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> &str {
        self.connector.port()
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        // A panic while holding the lock leaves at worst a half-written
        // frame; the link is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open the port now instead of on the first send
    pub fn open(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::Closed(self.name.clone()));
        }
        if state.link.is_none() {
            state.link = Some(self.connector.connect()?);
        }
        Ok(())
    }

    /// Send one frame, reopening the port and retrying on failure
    pub fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::Closed(self.name.clone()));
        }

        let attempts = self.retries + 1;
        for attempt in 1..=attempts {
            if attempt > 1 && !self.retry_delay.is_zero() {
                std::thread::sleep(self.retry_delay);
            }

            if state.link.is_none() {
                match self.connector.connect() {
                    Ok(link) => state.link = Some(link),
                    Err(e) => {
                        warn!("{} attempt {}/{}: {}", self.name, attempt, attempts, e);
                        continue;
                    }
                }
            }

            let Some(link) = state.link.as_mut() else {
                continue;
            };
            match link.write_frame(frame) {
                Ok(()) => {
                    debug!("TX {}: {}", self.name, hex(frame));
                    return Ok(());
                }
                Err(source) => {
                    let e = TransportError::Write {
                        port: self.port().to_string(),
                        source,
                    };
                    warn!("{} attempt {}/{}: {}", self.name, attempt, attempts, e);
                    // Reopen on the next attempt
                    state.link = None;
                }
            }
        }

        error!(
            "{}: dropping {} byte frame after {} attempts",
            self.name,
            frame.len(),
            attempts
        );
        Err(TransportError::Exhausted {
            port: self.port().to_string(),
            attempts,
        })
    }

    /// Release the port. Further sends fail with `Closed`.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.link.take().is_some() {
            info!("Closed {} ({})", self.name, self.port());
        }
        state.closed = true;
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Spaced uppercase hex, as the PLM logs frames
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
