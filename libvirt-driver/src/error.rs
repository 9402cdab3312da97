//! Error types for the libvirt machine driver.

use thiserror::Error;

/// Errors that can occur during driver operations.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Failed to connect to the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// A resource the driver does not create on its own is missing.
    ///
    /// The message always tells the operator how to provision it.
    #[error("{0}")]
    PrerequisiteMissing(String),

    /// The virtual network exists but cannot serve DHCP leases.
    #[error("{0}")]
    NetworkMisconfigured(String),

    /// The domain could not be looked up by name.
    #[error("Failed to fetch machine '{0}'")]
    MachineNotFound(String),

    /// The operation needs a running domain.
    #[error("host is not running")]
    NotRunning,

    /// Graceful shutdown was not observed within the polling budget.
    #[error("VM Failed to gracefully shutdown, try the kill command")]
    ShutdownTimeout,

    /// A volume resize would have truncated data.
    #[error("current disk image capacity is bigger than the requested size ({current} > {requested})")]
    ShrinkRefused {
        current: u64,
        requested: u64,
    },

    /// An external command exited unsuccessfully.
    #[error("error running {command}:\nCommand stdout:\n{stdout}\nstderr:\n{stderr}\nerror:\n{reason}")]
    CommandFailed {
        command: String,
        stdout: String,
        stderr: String,
        reason: String,
    },

    /// An external command did not finish in time and was killed.
    #[error("timed out waiting for command {command}:\nCommand stdout:\n{stdout}\nstderr:\n{stderr}")]
    CommandTimeout {
        command: String,
        stdout: String,
        stderr: String,
    },

    /// A configuration update stopped half way.
    ///
    /// `applied` lists the fields that reached the hypervisor before `failed`
    /// was rejected. They are not rolled back.
    #[error("configuration update failed on {failed} after applying [{}]: {source}", .applied.join(", "))]
    PartialUpdate {
        applied: Vec<String>,
        failed: String,
        #[source]
        source: Box<DriverError>,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The domain is in the wrong state for the requested operation.
    #[error("Invalid VM state for operation: {0}")]
    InvalidState(String),

    /// XML generation/parsing error.
    #[error("XML error: {0}")]
    Xml(String),

    /// Local filesystem error.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The hypervisor rejected an operation; carries its diagnostic verbatim.
    #[error("{operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },
}

impl DriverError {
    /// Wrap a hypervisor diagnostic for the given operation.
    pub fn backend(operation: &'static str, message: impl ToString) -> Self {
        DriverError::Backend {
            operation,
            message: message.to_string(),
        }
    }

    /// Wrap an I/O error with a description of what was attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        DriverError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<quick_xml::DeError> for DriverError {
    fn from(e: quick_xml::DeError) -> Self {
        DriverError::Xml(e.to_string())
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(e: serde_json::Error) -> Self {
        DriverError::InvalidConfig(e.to_string())
    }
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
