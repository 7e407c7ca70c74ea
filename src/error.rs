use std::fmt;

/// Error taxonomy shared by every fallible operation of the index.
///
/// Operations either complete and publish their effect or return one of
/// these without mutation; the only exception is path building, which may
/// leave empty (harmless) intermediate nodes attached when a later
/// allocation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// The level bit arithmetic of the configuration is inconsistent.
    InvalidConfig,
    /// Node or handle allocation failed.
    OutOfMemory,
    /// The walk reached a null slot, or the requested value is null.
    Absent,
    /// Insert without `replace` found the slot occupied.
    Exists,
    /// Cluster I/O failed or a cluster frame failed validation.
    IoFailure,
    /// The requested direction or operation is declared but not built.
    Unimplemented,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidConfig => "invalid index configuration",
            Error::OutOfMemory => "allocation failed",
            Error::Absent => "no value under this key",
            Error::Exists => "slot already occupied",
            Error::IoFailure => "cluster I/O failure",
            Error::Unimplemented => "operation not implemented",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(_err: std::io::Error) -> Self {
        Error::IoFailure
    }
}
