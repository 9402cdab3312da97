//! Disk image provisioning on the host filesystem.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{DriverError, Result};
use crate::exec::run_command;

const QEMU_IMG: &str = "qemu-img";
const QEMU_IMG_TIMEOUT: Duration = Duration::from_secs(300);

/// Create the machine disk at `dst` as a qcow2 overlay of `src`.
///
/// Falls back to a full copy when `qemu-img` is unavailable or fails.
pub async fn create_image(src: &Path, dst: &Path) -> Result<()> {
    let start = Instant::now();
    let backing = format!("backing_file={}", src.display());
    let dst_arg = dst.to_string_lossy();

    let overlay = run_command(
        QEMU_IMG,
        &["create", "-f", "qcow2", "-F", "qcow2", "-o", &backing, &dst_arg],
        QEMU_IMG_TIMEOUT,
    )
    .await;

    match overlay {
        Ok(_) => info!(src = %src.display(), dst = %dst.display(), "Created overlay disk image"),
        Err(e) => {
            warn!(error = %e, "qemu-img failed, copying the disk image instead");
            tokio::fs::copy(src, dst).await.map_err(|e| {
                DriverError::io(
                    format!("failed to copy {} to {}", src.display(), dst.display()),
                    e,
                )
            })?;
        }
    }

    debug!(elapsed_ms = start.elapsed().as_millis() as u64, "Disk image ready");
    Ok(())
}

/// Make every ancestor of `dir` searchable by other users, so the
/// hypervisor's unprivileged process can reach the disk image.
#[cfg(unix)]
pub async fn ensure_traversable(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    for ancestor in dir.ancestors() {
        if ancestor.as_os_str().is_empty() || ancestor == Path::new("/") {
            continue;
        }

        let meta = tokio::fs::metadata(ancestor).await.map_err(|e| {
            DriverError::io(format!("failed to stat {}", ancestor.display()), e)
        })?;
        let mut perms = meta.permissions();
        let mode = perms.mode();
        if mode & 0o001 != 0 {
            continue;
        }

        debug!(path = %ancestor.display(), "Adding o+x");
        perms.set_mode(mode | 0o001);
        tokio::fs::set_permissions(ancestor, perms).await.map_err(|e| {
            DriverError::io(format!("failed to chmod {}", ancestor.display()), e)
        })?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn ensure_traversable(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Drop the `.<machine>-exist` marker into the machine directory.
///
/// Best effort; a failure is only logged.
pub async fn write_marker(machine_dir: &Path, machine: &str) {
    let marker = machine_dir.join(format!(".{}-exist", machine));
    let result = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&marker)
        .await;

    if let Err(e) = result {
        debug!(path = %marker.display(), error = %e, "Failed to write marker file");
    }
}
