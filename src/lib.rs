//! Host-side wrapper for SAE J2534-1 v04.04 Pass-Thru drivers.
//!
//! Find an installed driver with [`discover_drivers`], load it into a
//! [`PassThruSession`] and drive the device through typed handles:
//!
//! ```no_run
//! use passthru::{discover_drivers, ConnectFlags, IoctlParameter, PassThruSession, ProtocolId};
//!
//! # fn main() -> passthru::Result<()> {
//! let driver = discover_drivers().into_iter().next().expect("no J2534 driver installed");
//! let mut session = PassThruSession::load(&driver)?;
//! let device = session.open()?;
//! let channel = session.connect(device, ProtocolId::Iso15765, ConnectFlags::empty(), 500_000)?;
//! let config = session.get_config(channel, &[IoctlParameter::DataRate])?;
//! println!("{:?}", config.get(IoctlParameter::DataRate));
//! # Ok(())
//! # }
//! ```

pub mod j2534;

pub use j2534::discover::{discover_drivers, DriverDescriptor, PointerWidth};
pub use j2534::dll::J2534Lib;
pub use j2534::error::{HandleRef, NativeStatus, Operation, PassThruError, Result};
pub use j2534::handles::{ChannelHandle, DeviceHandle, FilterHandle, PeriodicMsgHandle};
pub use j2534::ioctl::ConfigValues;
pub use j2534::message::Message;
pub use j2534::session::{IoctlTarget, PassThruSession, SessionConfig, MAX_READ_MSGS};
pub use j2534::types::{
    ConnectFlags, DataBits, DeviceVersion, ErrorId, FilterType, FiveBaudMode, IoctlId,
    IoctlParameter, NetworkLine, Parity, ProgrammingPin, ProgrammingVoltage, ProtocolFlags,
    ProtocolId, RxStatus, TxFlags,
};
pub use j2534::PassThruApi;
