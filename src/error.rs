//! Error types for hvaccel.
//!
//! Three classes of failure are unrecoverable while a guest is running:
//! running out of slots, detecting an inconsistent table, and the platform
//! hypervisor rejecting a call. The core components return them as ordinary
//! [`Error`] values; the production entry points hand them to [`fatal`].

use thiserror::Error;

/// Result type alias using hvaccel's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the acceleration layer.
#[derive(Error, Debug)]
pub enum Error {
    // Platform/hypervisor errors
    #[error("hypervisor not available on this platform")]
    HypervisorNotAvailable,

    #[error("hypervisor rejected {op}: {code:#x}")]
    BackendRejection { op: &'static str, code: i64 },

    // Slot table errors
    #[error("no free slot to map [{start:#x}, {end:#x}) (capacity {capacity})")]
    ResourceExhaustion { start: u64, end: u64, capacity: usize },

    #[error("slot table invariant violated: {0}")]
    InvariantViolation(String),

    #[error("slot table is poisoned by an earlier failure")]
    TablePoisoned,

    #[error("invalid region: gpa {gpa:#x} size {size:#x}")]
    InvalidRegion { gpa: u64, size: u64 },

    // vCPU errors
    #[error("unhandled exception class {class:#x} (iss {iss:#x})")]
    UnhandledException { class: u8, iss: u32 },

    #[error("unhandled exit reason {0}")]
    UnhandledExit(u32),

    #[error("unsupported memory abort at {gpa:#x}: {reason}")]
    UnsupportedAbort { gpa: u64, reason: &'static str },

    #[error("vCPU thread is gone")]
    VcpuGone,

    #[error("vCPU {0} is not serving requests")]
    VcpuStopped(u32),

    // Configuration errors
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Memory errors
    #[error("memory allocation failed: {0}")]
    MemoryAllocationFailed(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a backend rejection from a raw platform return code.
    pub fn backend(op: &'static str, code: impl Into<i64>) -> Self {
        Error::BackendRejection {
            op,
            code: code.into(),
        }
    }

    /// Whether this error leaves guest execution in a state that cannot
    /// continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::BackendRejection { .. }
                | Error::ResourceExhaustion { .. }
                | Error::InvariantViolation(_)
                | Error::TablePoisoned
                | Error::UnhandledException { .. }
                | Error::UnhandledExit(_)
                | Error::UnsupportedAbort { .. }
        )
    }
}

/// Log `err` and terminate the process.
///
/// `context` carries the diagnostic dump (attempted interval, conflicting
/// slots, exit record) collected by the caller.
pub fn fatal(err: &Error, context: &str) -> ! {
    tracing::error!(error = %err, "{context}");
    eprintln!("hvaccel: fatal: {err}\n{context}");
    std::process::abort()
}
