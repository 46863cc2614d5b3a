use std::fmt;

use crate::j2534::types::{c_text, ErrorId, IoctlParameter, PASSTHRU_TEXT_SIZE, STATUS_NOERROR};
use crate::j2534::PassThruApi;

pub type Result<T> = std::result::Result<T, PassThruError>;

/// Native entry points of a J2534 v04.04 driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Open,
    Close,
    Connect,
    Disconnect,
    ReadMsgs,
    WriteMsgs,
    StartPeriodicMsg,
    StopPeriodicMsg,
    StartMsgFilter,
    StopMsgFilter,
    SetProgrammingVoltage,
    ReadVersion,
    GetLastError,
    Ioctl,
}

impl Operation {
    pub const ALL: [Operation; 14] = [
        Self::Open,
        Self::Close,
        Self::Connect,
        Self::Disconnect,
        Self::ReadMsgs,
        Self::WriteMsgs,
        Self::StartPeriodicMsg,
        Self::StopPeriodicMsg,
        Self::StartMsgFilter,
        Self::StopMsgFilter,
        Self::SetProgrammingVoltage,
        Self::ReadVersion,
        Self::GetLastError,
        Self::Ioctl,
    ];

    /// Exported symbol name of the entry point
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Open => "PassThruOpen",
            Self::Close => "PassThruClose",
            Self::Connect => "PassThruConnect",
            Self::Disconnect => "PassThruDisconnect",
            Self::ReadMsgs => "PassThruReadMsgs",
            Self::WriteMsgs => "PassThruWriteMsgs",
            Self::StartPeriodicMsg => "PassThruStartPeriodicMsg",
            Self::StopPeriodicMsg => "PassThruStopPeriodicMsg",
            Self::StartMsgFilter => "PassThruStartMsgFilter",
            Self::StopMsgFilter => "PassThruStopMsgFilter",
            Self::SetProgrammingVoltage => "PassThruSetProgrammingVoltage",
            Self::ReadVersion => "PassThruReadVersion",
            Self::GetLastError => "PassThruGetLastError",
            Self::Ioctl => "PassThruIoctl",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A non-zero status returned by the driver, with the driver's own description if one was fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeStatus {
    pub error: ErrorId,
    pub description: String,
}

impl NativeStatus {
    pub fn code(&self) -> u32 {
        self.error.raw()
    }
}

impl fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.error.message(), self.code())?;
        if !self.description.is_empty() {
            write!(f, ": {}", self.description)?;
        }
        Ok(())
    }
}

/// Identifies a handle in error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleRef {
    Device(u32),
    Channel(u32),
    Filter { channel: u32, filter: u32 },
    PeriodicMsg { channel: u32, msg: u32 },
}

impl fmt::Display for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(id) => write!(f, "device {}", id),
            Self::Channel(id) => write!(f, "channel {}", id),
            Self::Filter { channel, filter } => {
                write!(f, "filter {} on channel {}", filter, channel)
            }
            Self::PeriodicMsg { channel, msg } => {
                write!(f, "periodic message {} on channel {}", msg, channel)
            }
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PassThruError {
    #[error("failed to load J2534 driver '{path}': {reason}")]
    DriverLoad { path: String, reason: String },
    #[error("{0} not found in J2534 driver")]
    EntryPointMissing(&'static str),
    #[error("J2534 driver has been unloaded")]
    DriverUnloaded,
    #[error("{0} is not open in this session")]
    StaleHandle(HandleRef),
    #[error("PassThruOpen failed: {0}")]
    DeviceOpen(NativeStatus),
    #[error("PassThruConnect failed: {0}")]
    Connect(NativeStatus),
    #[error("PassThruIoctl failed: {0}")]
    Ioctl(NativeStatus),
    #[error("{operation} failed: {status}")]
    Native {
        operation: Operation,
        status: NativeStatus,
    },
    #[error("message payload of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },
    #[error("ioctl parameter {0} appears more than once")]
    DuplicateParameter(IoctlParameter),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("malformed data from driver: {0}")]
    Malformed(String),
    #[error("unknown J2534 status code 0x{0:X}")]
    Unknown(u32),
}

impl PassThruError {
    /// Status reported by the driver, if this error came from a native call
    pub fn status(&self) -> Option<&NativeStatus> {
        match self {
            Self::DeviceOpen(status) | Self::Connect(status) | Self::Ioctl(status) => Some(status),
            Self::Native { status, .. } => Some(status),
            _ => None,
        }
    }

    pub fn error_id(&self) -> Option<ErrorId> {
        self.status().map(|s| s.error)
    }
}

/// Maps a native return code onto the error taxonomy.
///
/// `describe` is only invoked for codes that are errors.
pub fn translate<F>(operation: Operation, status: u32, describe: F) -> Result<()>
where
    F: FnOnce() -> String,
{
    if status == STATUS_NOERROR {
        return Ok(());
    }
    let Some(error) = ErrorId::from_raw(status) else {
        return Err(PassThruError::Unknown(status));
    };
    let status = NativeStatus {
        error,
        description: describe(),
    };
    Err(match operation {
        Operation::Open => PassThruError::DeviceOpen(status),
        Operation::Connect => PassThruError::Connect(status),
        Operation::Ioctl => PassThruError::Ioctl(status),
        operation => PassThruError::Native { operation, status },
    })
}

/// Best-effort PassThruGetLastError; empty when the driver cannot say
pub fn last_error_text<A: PassThruApi + ?Sized>(api: &A) -> String {
    let mut text = [0u8; PASSTHRU_TEXT_SIZE];
    if api.get_last_error(&mut text) != STATUS_NOERROR {
        return String::new();
    }
    c_text(&text)
}
