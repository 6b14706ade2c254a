//! Serial device plumbing
//!
//! This module provides:
//! - Port discovery and raw connections (`port`)
//! - A locked, retrying transport per device (`transport`)
//! - A latest-wins writer task in front of each transport (`writer`)

pub mod port;
pub mod transport;
pub mod writer;

pub use transport::SerialTransport;
pub use writer::{DeviceJob, LatestWriter, WriterOptions};
