//! # libvirt-driver common
//!
//! Shared utilities for the libvirt machine driver binaries.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use libvirt_driver_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(machine = "crc", "Starting VM");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, LogFormat};
