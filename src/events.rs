//! Host playback notifications
//!
//! The media player reports what it is doing as JSON, one object per stdin
//! line or per UDP datagram:
//!
//! ```text
//! {"event":"started","title":{"name":"Movie A","year":1999,"imdb":"tt0133093"},"player_ratio":"1.78"}
//! {"event":"paused"}
//! {"event":"trigger","name":"aspectratiochanger-set235","expiry_ms":10000}
//! {"event":"menu_selected","ratio":"2.35"}
//! ```
//!
//! Listeners turn these into `Event`s on the loop channel. A line that does
//! not parse is logged and skipped.

use crate::aspect::AspectRatio;
use crate::dispatch::TriggerAction;
use crate::error::EventError;
use crate::metadata::Lookup;
use crate::title::{Title, TitleKey};
use log::{debug, info, warn};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Largest datagram accepted on the UDP listener
const MAX_DATAGRAM: usize = 4096;
/// Consecutive receive errors before the UDP listener gives up
const MAX_UDP_ERRORS: u32 = 10;

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum HostEvent {
    #[serde(alias = "now_playing_changed")]
    Started {
        title: NowPlaying,
        #[serde(default)]
        player_ratio: Option<String>,
    },
    Stopped,
    Ended,
    Paused,
    Resumed,
    Trigger {
        name: String,
        #[serde(default)]
        expiry_ms: Option<u64>,
    },
    MenuSelected {
        ratio: String,
    },
    MenuCancelled,
}

/// What the player says is on screen
#[derive(Debug, Deserialize)]
pub struct NowPlaying {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub year: Option<u16>,
    #[serde(default)]
    pub imdb: Option<String>,
    #[serde(default)]
    pub tvshow_id: Option<u32>,
}

impl NowPlaying {
    pub fn title(&self) -> Title {
        Title::new(
            &self.name,
            self.year,
            self.imdb.as_deref(),
            self.tvshow_id,
        )
    }
}

/// Everything the event loop reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Started {
        title: Title,
        player_ratio: Option<AspectRatio>,
    },
    Stopped,
    Paused,
    Resumed,
    Trigger {
        action: TriggerAction,
        /// Falls back to the configured default when absent
        expiry: Option<Duration>,
        received: Instant,
    },
    MenuSelected(AspectRatio),
    MenuCancelled,
    Resolved {
        key: TitleKey,
        lookup: Lookup,
    },
    /// A listener reached end of input
    InputClosed,
}

impl Event {
    /// Parse one JSON notification
    pub fn parse(text: &str, received: Instant) -> Result<Event, EventError> {
        let event = match serde_json::from_str::<HostEvent>(text.trim())? {
            HostEvent::Started {
                title,
                player_ratio,
            } => Event::Started {
                title: title.title(),
                player_ratio: player_ratio.as_deref().and_then(AspectRatio::parse_loose),
            },
            HostEvent::Stopped | HostEvent::Ended => Event::Stopped,
            HostEvent::Paused => Event::Paused,
            HostEvent::Resumed => Event::Resumed,
            HostEvent::Trigger { name, expiry_ms } => Event::Trigger {
                action: name.parse()?,
                expiry: expiry_ms.map(Duration::from_millis),
                received,
            },
            HostEvent::MenuSelected { ratio } => Event::MenuSelected(ratio.parse()?),
            HostEvent::MenuCancelled => Event::MenuCancelled,
        };
        Ok(event)
    }
}

fn forward(text: &str, source: &str) -> Option<Event> {
    if text.trim().is_empty() {
        return None;
    }
    match Event::parse(text, Instant::now()) {
        Ok(event) => {
            debug!("{}: {:?}", source, event);
            Some(event)
        }
        Err(e) => {
            warn!("Ignoring {} event {:?}: {}", source, text.trim(), e);
            None
        }
    }
}

/// Read events from stdin until it closes
pub async fn listen_stdin(tx: mpsc::Sender<Event>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(event) = forward(&line, "stdin") {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("stdin read failed: {}", e);
                break;
            }
        }
    }

    info!("stdin closed");
    let _ = tx.send(Event::InputClosed).await;
}

/// Bind the UDP listener; binding errors are startup errors
pub async fn bind_udp(addr: &str) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;
    info!("Listening for events on udp://{}", socket.local_addr()?);
    Ok(socket)
}

/// Wait before the next receive after `errors` failures in a row; `None`
/// once the socket should be given up
fn udp_error_backoff(errors: u32) -> Option<Duration> {
    if errors >= MAX_UDP_ERRORS {
        return None;
    }
    Some(Duration::from_millis(50u64 << errors.min(5)))
}

/// Read one event per datagram until the loop goes away
pub async fn listen_udp(socket: UdpSocket, tx: mpsc::Sender<Event>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut errors = 0;

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => {
                errors = 0;
                received
            }
            Err(e) => {
                errors += 1;
                warn!("UDP receive failed ({} in a row): {}", errors, e);
                match udp_error_backoff(errors) {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    None => break,
                }
            }
        };
        let text = String::from_utf8_lossy(&buf[..len]);
        let source = format!("udp {}", peer);
        if let Some(event) = forward(&text, &source) {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }

    warn!("UDP listener giving up after {} errors", errors);
    let _ = tx.send(Event::InputClosed).await;
}
