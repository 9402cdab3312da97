//! Hypervisor backends.
//!
//! - [`VirshBackend`] shells out to `virsh` and is always available.
//! - `LibvirtBackend` talks to libvirt natively. It requires the `libvirt`
//!   feature and the system libvirt library.

#[cfg(feature = "libvirt")]
mod libvirt;
mod virsh;

#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtBackend;
pub use virsh::{VirshBackend, DEFAULT_VIRSH_TIMEOUT};

/// Check if the native libvirt backend is compiled in.
pub fn native_available() -> bool {
    cfg!(feature = "libvirt")
}
