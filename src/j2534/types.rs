use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Size of the data field inside a native PASSTHRU_MSG
pub const PASSTHRU_DATA_SIZE: usize = 4128;

/// Largest payload accepted by the message codec
pub const MAX_MSG_DATA_SIZE: usize = 4028;

/// Size of the text buffers used by PassThruReadVersion and PassThruGetLastError
pub const PASSTHRU_TEXT_SIZE: usize = 80;

pub const STATUS_NOERROR: u32 = 0x00;

/// Declares a closed J2534 enumeration together with its value table.
///
/// Each variant maps to exactly one numeric id and one J2534 identifier; both
/// directions are resolved from the same table.
macro_rules! j2534_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal => $label:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u32)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub const fn raw(self) -> u32 {
                self as u32
            }

            pub fn from_raw(raw: u32) -> Option<Self> {
                match raw {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            /// Identifier used by the J2534 headers (and the driver registry)
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

j2534_enum! {
    /// J2534 Protocol IDs
    #[derive(Serialize, Deserialize)]
    pub enum ProtocolId {
        J1850Vpw = 0x01 => "J1850VPW",
        J1850Pwm = 0x02 => "J1850PWM",
        Iso9141 = 0x03 => "ISO9141",
        Iso14230 = 0x04 => "ISO14230",
        Can = 0x05 => "CAN",
        Iso15765 = 0x06 => "ISO15765",
        SciAEngine = 0x07 => "SCI_A_ENGINE",
        SciATrans = 0x08 => "SCI_A_TRANS",
        SciBEngine = 0x09 => "SCI_B_ENGINE",
        SciBTrans = 0x0A => "SCI_B_TRANS",
    }
}

j2534_enum! {
    /// J2534 Filter Types
    pub enum FilterType {
        /// Allows matching messages into the receive queue (non-ISO15765 channels)
        Pass = 0x01 => "PASS_FILTER",
        /// Keeps matching messages out of the receive queue (non-ISO15765 channels)
        Block = 0x02 => "BLOCK_FILTER",
        /// Pass filter plus the outgoing flow control message (ISO15765 channels only)
        FlowControl = 0x03 => "FLOW_CONTROL_FILTER",
    }
}

j2534_enum! {
    /// J2534 IOCTL IDs
    pub enum IoctlId {
        GetConfig = 0x01 => "GET_CONFIG",
        SetConfig = 0x02 => "SET_CONFIG",
        ReadVbatt = 0x03 => "READ_VBATT",
        FiveBaudInit = 0x04 => "FIVE_BAUD_INIT",
        FastInit = 0x05 => "FAST_INIT",
        ClearTxBuffer = 0x07 => "CLEAR_TX_BUFFER",
        ClearRxBuffer = 0x08 => "CLEAR_RX_BUFFER",
        ClearPeriodicMsgs = 0x09 => "CLEAR_PERIODIC_MSGS",
        ClearMsgFilters = 0x0A => "CLEAR_MSG_FILTERS",
        ClearFunctMsgLookupTable = 0x0B => "CLEAR_FUNCT_MSG_LOOKUP_TABLE",
        AddToFunctMsgLookupTable = 0x0C => "ADD_TO_FUNCT_MSG_LOOKUP_TABLE",
        DeleteFromFunctMsgLookupTable = 0x0D => "DELETE_FROM_FUNCT_MSG_LOOKUP_TABLE",
        ReadProgVoltage = 0x0E => "READ_PROG_VOLTAGE",
    }
}

j2534_enum! {
    /// Config parameter IDs for GET_CONFIG / SET_CONFIG
    pub enum IoctlParameter {
        DataRate = 0x01 => "DATA_RATE",
        Loopback = 0x03 => "LOOPBACK",
        NodeAddress = 0x04 => "NODE_ADDRESS",
        NetworkLine = 0x05 => "NETWORK_LINE",
        P1Min = 0x06 => "P1_MIN",
        P1Max = 0x07 => "P1_MAX",
        P2Min = 0x08 => "P2_MIN",
        P2Max = 0x09 => "P2_MAX",
        P3Min = 0x0A => "P3_MIN",
        P3Max = 0x0B => "P3_MAX",
        P4Min = 0x0C => "P4_MIN",
        P4Max = 0x0D => "P4_MAX",
        W1 = 0x0E => "W1",
        W2 = 0x0F => "W2",
        W3 = 0x10 => "W3",
        W4 = 0x11 => "W4",
        W5 = 0x12 => "W5",
        Tidle = 0x13 => "TIDLE",
        Tinil = 0x14 => "TINIL",
        Twup = 0x15 => "TWUP",
        Parity = 0x16 => "PARITY",
        BitSamplePoint = 0x17 => "BIT_SAMPLE_POINT",
        SyncJumpWidth = 0x18 => "SYNC_JUMP_WIDTH",
        W0 = 0x19 => "W0",
        T1Max = 0x1A => "T1_MAX",
        T2Max = 0x1B => "T2_MAX",
        T4Max = 0x1C => "T4_MAX",
        T5Max = 0x1D => "T5_MAX",
        Iso15765Bs = 0x1E => "ISO15765_BS",
        Iso15765Stmin = 0x1F => "ISO15765_STMIN",
        DataBits = 0x20 => "DATA_BITS",
        FiveBaudMod = 0x21 => "FIVE_BAUD_MOD",
        BsTx = 0x22 => "BS_TX",
        StminTx = 0x23 => "STMIN_TX",
        T3Max = 0x24 => "T3_MAX",
        Iso15765WftMax = 0x25 => "ISO15765_WFT_MAX",
    }
}

impl IoctlParameter {
    /// Parameters J2534-1 reserves for the interface; applications should not touch them.
    pub fn is_reserved_for_interface(self) -> bool {
        matches!(
            self,
            Self::P1Min | Self::P2Min | Self::P2Max | Self::P3Max | Self::P4Max
        )
    }
}

j2534_enum! {
    /// J2534 error codes (every non-zero status a driver may return)
    pub enum ErrorId {
        NotSupported = 0x01 => "ERR_NOT_SUPPORTED",
        InvalidChannelId = 0x02 => "ERR_INVALID_CHANNEL_ID",
        InvalidProtocolId = 0x03 => "ERR_INVALID_PROTOCOL_ID",
        NullParameter = 0x04 => "ERR_NULL_PARAMETER",
        InvalidIoctlValue = 0x05 => "ERR_INVALID_IOCTL_VALUE",
        InvalidFlags = 0x06 => "ERR_INVALID_FLAGS",
        Failed = 0x07 => "ERR_FAILED",
        DeviceNotConnected = 0x08 => "ERR_DEVICE_NOT_CONNECTED",
        Timeout = 0x09 => "ERR_TIMEOUT",
        InvalidMsg = 0x0A => "ERR_INVALID_MSG",
        InvalidTimeInterval = 0x0B => "ERR_INVALID_TIME_INTERVAL",
        ExceededLimit = 0x0C => "ERR_EXCEEDED_LIMIT",
        InvalidMsgId = 0x0D => "ERR_INVALID_MSG_ID",
        DeviceInUse = 0x0E => "ERR_DEVICE_IN_USE",
        InvalidIoctlId = 0x0F => "ERR_INVALID_IOCTL_ID",
        BufferEmpty = 0x10 => "ERR_BUFFER_EMPTY",
        BufferFull = 0x11 => "ERR_BUFFER_FULL",
        BufferOverflow = 0x12 => "ERR_BUFFER_OVERFLOW",
        PinInvalid = 0x13 => "ERR_PIN_INVALID",
        ChannelInUse = 0x14 => "ERR_CHANNEL_IN_USE",
        MsgProtocolId = 0x15 => "ERR_MSG_PROTOCOL_ID",
        InvalidFilterId = 0x16 => "ERR_INVALID_FILTER_ID",
        NoFlowControl = 0x17 => "ERR_NO_FLOW_CONTROL",
        NotUnique = 0x18 => "ERR_NOT_UNIQUE",
        InvalidBaudrate = 0x19 => "ERR_INVALID_BAUDRATE",
        InvalidDeviceId = 0x1A => "ERR_INVALID_DEVICE_ID",
    }
}

impl ErrorId {
    /// Short human readable form
    pub fn message(self) -> &'static str {
        match self {
            Self::NotSupported => "Not supported",
            Self::InvalidChannelId => "Invalid channel ID",
            Self::InvalidProtocolId => "Invalid protocol ID",
            Self::NullParameter => "Null parameter",
            Self::InvalidIoctlValue => "Invalid IOCTL value",
            Self::InvalidFlags => "Invalid flags",
            Self::Failed => "Failed",
            Self::DeviceNotConnected => "Device not connected",
            Self::Timeout => "Timeout",
            Self::InvalidMsg => "Invalid message",
            Self::InvalidTimeInterval => "Invalid time interval",
            Self::ExceededLimit => "Exceeded limit",
            Self::InvalidMsgId => "Invalid message ID",
            Self::DeviceInUse => "Device in use",
            Self::InvalidIoctlId => "Invalid IOCTL ID",
            Self::BufferEmpty => "Buffer empty",
            Self::BufferFull => "Buffer full",
            Self::BufferOverflow => "Buffer overflow",
            Self::PinInvalid => "Pin invalid",
            Self::ChannelInUse => "Channel in use",
            Self::MsgProtocolId => "Message protocol ID mismatch",
            Self::InvalidFilterId => "Invalid filter ID",
            Self::NoFlowControl => "No flow control",
            Self::NotUnique => "Not unique",
            Self::InvalidBaudrate => "Invalid baudrate",
            Self::InvalidDeviceId => "Invalid device ID",
        }
    }

    /// Meaning of the code as documented by J2534-1 v04.04
    pub fn description(self) -> &'static str {
        match self {
            Self::NotSupported => {
                "Device cannot support the requested functionality; it is not fully J2534 compliant"
            }
            Self::InvalidChannelId => "Invalid ChannelID value",
            Self::InvalidProtocolId => {
                "Invalid or unsupported ProtocolID, or a resource conflict with another connected protocol"
            }
            Self::NullParameter => "NULL pointer supplied where a valid pointer is required",
            Self::InvalidIoctlValue => "Invalid value for an Ioctl parameter",
            Self::InvalidFlags => "Invalid flag values",
            Self::Failed => "Undefined error; use PassThruGetLastError for a description",
            Self::DeviceNotConnected => "Unable to communicate with the device",
            Self::Timeout => "Timeout elapsed before the requested number of messages was transferred",
            Self::InvalidMsg => "Message structure is invalid for the given ChannelID",
            Self::InvalidTimeInterval => "Invalid TimeInterval value",
            Self::ExceededLimit => "Exceeded the maximum number of filters or periodic messages",
            Self::InvalidMsgId => "Invalid MsgID value",
            Self::DeviceInUse => "Device is currently open",
            Self::InvalidIoctlId => "Invalid IoctlID value",
            Self::BufferEmpty => "Receive buffer is empty; no messages available to read",
            Self::BufferFull => "Transmit buffer is full; not all messages were queued",
            Self::BufferOverflow => "Receive buffer overflowed and messages were lost",
            Self::PinInvalid => "Unknown pin number or pin already in use",
            Self::ChannelInUse => "Channel number is currently connected",
            Self::MsgProtocolId => "Message protocol does not match the channel protocol",
            Self::InvalidFilterId => "Invalid FilterID value",
            Self::NoFlowControl => "No flow control filter matches the outgoing ISO15765 message",
            Self::NotUnique => "CAN ID already used by an existing flow control filter",
            Self::InvalidBaudrate => "Requested baud rate cannot be achieved within tolerance",
            Self::InvalidDeviceId => "Device ID invalid",
        }
    }
}

j2534_enum! {
    /// Pins accepted by PassThruSetProgrammingVoltage
    pub enum ProgrammingPin {
        AuxOutput = 0 => "AUX_OUTPUT",
        Pin6 = 6 => "PIN6",
        Pin9 = 9 => "PIN9",
        Pin11 = 11 => "PIN11",
        Pin12 = 12 => "PIN12",
        Pin13 = 13 => "PIN13",
        Pin14 = 14 => "PIN14",
        Pin15 = 15 => "PIN15",
    }
}

j2534_enum! {
    /// Values for the NETWORK_LINE parameter (J1850PWM)
    pub enum NetworkLine {
        BusNormal = 0 => "BUS_NORMAL",
        BusPlus = 1 => "BUS_PLUS",
        BusMinus = 2 => "BUS_MINUS",
    }
}

j2534_enum! {
    /// Values for the PARITY parameter
    pub enum Parity {
        NoParity = 0 => "NO_PARITY",
        Odd = 1 => "ODD_PARITY",
        Even = 2 => "EVEN_PARITY",
    }
}

j2534_enum! {
    /// Values for the DATA_BITS parameter
    pub enum DataBits {
        Eight = 0 => "DATA_BITS_8",
        Seven = 1 => "DATA_BITS_7",
    }
}

j2534_enum! {
    /// Values for the FIVE_BAUD_MOD parameter
    pub enum FiveBaudMode {
        Iso9141Iso14230 = 0 => "ISO9141_2_14230_4",
        Iso9141InvertKey2 = 1 => "ISO9141_INVERT_KEY2",
        Iso9141InvertAddress = 2 => "ISO9141_INVERT_ADDR",
        Iso9141 = 3 => "ISO9141",
    }
}

/// Voltage argument of PassThruSetProgrammingVoltage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgrammingVoltage {
    Millivolts(u32),
    ShortToGround,
    Off,
}

impl ProgrammingVoltage {
    pub const MIN_MILLIVOLTS: u32 = 5_000;
    pub const MAX_MILLIVOLTS: u32 = 20_000;
    const SHORT_TO_GROUND: u32 = 0xFFFF_FFFE;
    const VOLTAGE_OFF: u32 = 0xFFFF_FFFF;

    pub fn raw(self) -> u32 {
        match self {
            Self::Millivolts(mv) => mv,
            Self::ShortToGround => Self::SHORT_TO_GROUND,
            Self::Off => Self::VOLTAGE_OFF,
        }
    }

    pub fn is_valid(self) -> bool {
        match self {
            Self::Millivolts(mv) => (Self::MIN_MILLIVOLTS..=Self::MAX_MILLIVOLTS).contains(&mv),
            Self::ShortToGround | Self::Off => true,
        }
    }
}

bitflags! {
    /// Flags passed to PassThruConnect
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConnectFlags: u32 {
        const CAN_29BIT_ID = 0x0000_0100;
        const ISO9141_NO_CHECKSUM = 0x0000_0200;
        const CAN_ID_BOTH = 0x0000_0800;
        const ISO9141_K_LINE_ONLY = 0x0000_1000;
    }
}

/// Connect flags are protocol specific; J2534 calls them protocol flags as well.
pub type ProtocolFlags = ConnectFlags;

bitflags! {
    /// TxFlags of an outgoing PASSTHRU_MSG
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TxFlags: u32 {
        const ISO15765_FRAME_PAD = 0x0000_0040;
        const ISO15765_ADDR_TYPE = 0x0000_0080;
        const CAN_29BIT_ID = 0x0000_0100;
        const WAIT_P3_MIN_ONLY = 0x0000_0200;
        const SWCAN_HV_TX = 0x0000_0400;
        const SCI_MODE = 0x0040_0000;
        const SCI_TX_VOLTAGE = 0x0080_0000;

        const ISO15765_CAN_ID_11 = Self::ISO15765_FRAME_PAD.bits();
        const ISO15765_CAN_ID_29 = Self::ISO15765_FRAME_PAD.bits() | Self::CAN_29BIT_ID.bits();
    }
}

bitflags! {
    /// RxStatus of a received PASSTHRU_MSG
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RxStatus: u32 {
        const TX_MSG_TYPE = 0x0000_0001;
        const START_OF_MESSAGE = 0x0000_0002;
        const RX_BREAK = 0x0000_0004;
        const TX_INDICATION = 0x0000_0008;
        const ISO15765_PADDING_ERROR = 0x0000_0010;
        const ISO15765_ADDR_TYPE = 0x0000_0080;
        const CAN_29BIT_ID = 0x0000_0100;

        /// Echo of a message this channel transmitted
        const LOOPBACK = Self::TX_MSG_TYPE.bits();
        const TX_DONE = Self::TX_MSG_TYPE.bits() | Self::TX_INDICATION.bits();
    }
}

/// PASSTHRU_MSG structure matching the J2534 API spec
#[repr(C)]
#[derive(Clone)]
pub struct PassThruMsg {
    pub protocol_id: u32,
    pub rx_status: u32,
    pub tx_flags: u32,
    pub timestamp: u32,
    pub data_size: u32,
    pub extra_data_index: u32,
    pub data: [u8; PASSTHRU_DATA_SIZE],
}

impl Default for PassThruMsg {
    fn default() -> Self {
        Self {
            protocol_id: 0,
            rx_status: 0,
            tx_flags: 0,
            timestamp: 0,
            data_size: 0,
            extra_data_index: 0,
            data: [0u8; PASSTHRU_DATA_SIZE],
        }
    }
}

impl fmt::Debug for PassThruMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = (self.data_size as usize).min(PASSTHRU_DATA_SIZE);
        f.debug_struct("PassThruMsg")
            .field("protocol_id", &self.protocol_id)
            .field("rx_status", &format_args!("0x{:08X}", self.rx_status))
            .field("tx_flags", &format_args!("0x{:08X}", self.tx_flags))
            .field("timestamp", &self.timestamp)
            .field("data_size", &self.data_size)
            .field("extra_data_index", &self.extra_data_index)
            .field(
                "data",
                &format_args!(
                    "[{}]",
                    self.data[..len]
                        .iter()
                        .map(|b| format!("{:02X}", b))
                        .collect::<Vec<_>>()
                        .join(" ")
                ),
            )
            .finish()
    }
}

/// SCONFIG structure for IOCTL
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SConfig {
    pub parameter: u32,
    pub value: u32,
}

/// SCONFIG_LIST structure for IOCTL
#[repr(C)]
#[derive(Debug)]
pub struct SConfigList {
    pub num_of_params: u32,
    pub config_ptr: *mut SConfig,
}

impl SConfigList {
    /// Borrows `configs` for the lifetime of one ioctl call
    pub fn new(configs: &mut [SConfig]) -> Self {
        Self {
            num_of_params: configs.len() as u32,
            config_ptr: configs.as_mut_ptr(),
        }
    }
}

/// SBYTE_ARRAY structure for IOCTL
#[repr(C)]
#[derive(Debug)]
pub struct SByteArray {
    pub num_of_bytes: u32,
    pub byte_ptr: *mut u8,
}

impl SByteArray {
    pub fn new(bytes: &mut [u8]) -> Self {
        Self {
            num_of_bytes: bytes.len() as u32,
            byte_ptr: bytes.as_mut_ptr(),
        }
    }
}

/// Version info from a J2534 device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceVersion {
    pub firmware: String,
    pub dll: String,
    pub api: String,
}

/// Decodes a NUL terminated text buffer filled in by the driver
pub fn c_text(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
