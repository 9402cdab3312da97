//! # libvirt-driver
//!
//! Machine driver that provisions and manages a single libvirt/KVM virtual
//! machine on behalf of an orchestrating tool.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                Driver                   │
//! │  (create, start, stop, get_ip, etc.)    │
//! └──────┬──────────────┬──────────────┬────┘
//!        ▼              ▼              ▼
//!  StorageManager  NetworkValidator  AddressResolver
//!        └──────────────┼──────────────┘
//!                       ▼
//! ┌─────────────────────────────────────────┐
//! │            Hypervisor Trait             │
//! └──────┬──────────────┬──────────────┬────┘
//!        ▼              ▼              ▼
//!  LibvirtBackend   VirshBackend   MockBackend
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use libvirt_driver::{Driver, DriverConfig, VirshBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = DriverConfig::new("crc", "/home/user/.crc")
//!         .with_memory(9216)
//!         .with_image_source("/home/user/.crc/cache/crc.qcow2");
//!     let backend = Arc::new(VirshBackend::new(&config.connection_uri));
//!
//!     let mut driver = Driver::new(config, backend);
//!     driver.create().await.unwrap();
//!     println!("{}", driver.get_ip().await.unwrap());
//! }
//! ```

pub mod address;
pub mod backend;
pub mod config;
pub mod driver;
pub mod error;
pub mod exec;
pub mod image;
pub mod mock;
pub mod network;
pub mod poll;
pub mod storage;
pub mod traits;
pub mod types;
pub mod xml;

pub use backend::VirshBackend;
#[cfg(feature = "libvirt")]
pub use backend::LibvirtBackend;
pub use config::{DriverConfig, NetworkDefinition};
pub use driver::Driver;
pub use error::{DriverError, Result};
pub use mock::MockBackend;
pub use poll::Poller;
pub use traits::Hypervisor;
pub use types::*;
