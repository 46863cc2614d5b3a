use std::fmt;

use crate::j2534::error::{PassThruError, Result};
use crate::j2534::types::*;

/// A Pass-Thru message in its typed form.
///
/// `data` holds the message bytes; for ISO15765 and CAN the first four bytes
/// are the big-endian CAN ID. `extra_data_index` is carried verbatim: J2534
/// drivers use it to mark where checksum/CRC bytes start in received data.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub protocol: ProtocolId,
    pub rx_status: RxStatus,
    pub tx_flags: TxFlags,
    pub timestamp: u32,
    pub extra_data_index: u32,
    pub data: Vec<u8>,
}

impl Message {
    /// Transmit message with no flags; `extra_data_index` covers the whole payload
    pub fn new(protocol: ProtocolId, data: &[u8]) -> Self {
        Self {
            protocol,
            rx_status: RxStatus::empty(),
            tx_flags: TxFlags::empty(),
            timestamp: 0,
            extra_data_index: data.len() as u32,
            data: data.to_vec(),
        }
    }

    pub fn with_tx_flags(mut self, tx_flags: TxFlags) -> Self {
        self.tx_flags = tx_flags;
        self
    }

    /// ISO15765 message: 4-byte CAN ID header followed by the payload, frame padded
    pub fn iso15765(can_id: u32, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(4 + payload.len());
        data.extend_from_slice(&can_id.to_be_bytes());
        data.extend_from_slice(payload);
        Self::new(ProtocolId::Iso15765, &data).with_tx_flags(TxFlags::ISO15765_FRAME_PAD)
    }

    /// Raw CAN frame: 4-byte CAN ID header followed by the payload.
    ///
    /// The payload is kept as given. A frame with more than 8 data bytes is
    /// rejected by the driver with `ERR_INVALID_MSG` when written.
    pub fn can(can_id: u32, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(4 + payload.len());
        data.extend_from_slice(&can_id.to_be_bytes());
        data.extend_from_slice(payload);
        Self::new(ProtocolId::Can, &data)
    }

    /// CAN ID header of a CAN / ISO15765 message
    pub fn can_id(&self) -> Option<u32> {
        let header: [u8; 4] = self.data.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(header))
    }

    /// Bytes after the CAN ID header
    pub fn payload(&self) -> &[u8] {
        self.data.get(4..).unwrap_or(&[])
    }

    pub fn data_size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Writes this message into the native layout.
    ///
    /// Fails before anything reaches the driver if the payload is over
    /// `MAX_MSG_DATA_SIZE`.
    pub fn to_native(&self) -> Result<PassThruMsg> {
        if self.data.len() > MAX_MSG_DATA_SIZE {
            return Err(PassThruError::MessageTooLarge {
                size: self.data.len(),
                max: MAX_MSG_DATA_SIZE,
            });
        }
        let mut msg = PassThruMsg {
            protocol_id: self.protocol.raw(),
            rx_status: self.rx_status.bits(),
            tx_flags: self.tx_flags.bits(),
            timestamp: self.timestamp,
            data_size: self.data.len() as u32,
            extra_data_index: self.extra_data_index,
            ..Default::default()
        };
        msg.data[..self.data.len()].copy_from_slice(&self.data);
        Ok(msg)
    }

    /// Reads a message the driver filled in
    pub fn from_native(msg: &PassThruMsg) -> Result<Self> {
        let size = msg.data_size as usize;
        if size > PASSTHRU_DATA_SIZE {
            return Err(PassThruError::Malformed(format!(
                "message data size {} exceeds the {} byte buffer",
                size, PASSTHRU_DATA_SIZE
            )));
        }
        let protocol = ProtocolId::from_raw(msg.protocol_id).ok_or_else(|| {
            PassThruError::Malformed(format!("unknown protocol id 0x{:X}", msg.protocol_id))
        })?;
        Ok(Self {
            protocol,
            rx_status: RxStatus::from_bits_retain(msg.rx_status),
            tx_flags: TxFlags::from_bits_retain(msg.tx_flags),
            timestamp: msg.timestamp,
            extra_data_index: msg.extra_data_index,
            data: msg.data[..size].to_vec(),
        })
    }
}

impl TryFrom<&Message> for PassThruMsg {
    type Error = PassThruError;

    fn try_from(msg: &Message) -> Result<Self> {
        msg.to_native()
    }
}

impl TryFrom<&PassThruMsg> for Message {
    type Error = PassThruError;

    fn try_from(msg: &PassThruMsg) -> Result<Self> {
        Message::from_native(msg)
    }
}

/// Encodes a batch, rejecting the whole batch if any message is oversized
pub(crate) fn encode_all(msgs: &[Message]) -> Result<Vec<PassThruMsg>> {
    msgs.iter().map(Message::to_native).collect()
}

/// Decodes the first `count` entries; anything past the reported count is never read
pub(crate) fn decode_reported(buffer: &[PassThruMsg], count: u32) -> Result<Vec<Message>> {
    let count = (count as usize).min(buffer.len());
    buffer[..count].iter().map(Message::from_native).collect()
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("protocol", &self.protocol)
            .field("rx_status", &self.rx_status)
            .field("tx_flags", &self.tx_flags)
            .field("timestamp", &self.timestamp)
            .field("extra_data_index", &self.extra_data_index)
            .field(
                "data",
                &format_args!(
                    "[{}]",
                    self.data
                        .iter()
                        .map(|b| format!("{:02X}", b))
                        .collect::<Vec<_>>()
                        .join(" ")
                ),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Message {
        Message {
            protocol: ProtocolId::Iso9141,
            rx_status: RxStatus::START_OF_MESSAGE,
            tx_flags: TxFlags::WAIT_P3_MIN_ONLY,
            timestamp: 0xDEAD_BEEF,
            extra_data_index: len.saturating_sub(1) as u32,
            data: (0..len).map(|i| (i % 251) as u8).collect(),
        }
    }

    #[test]
    fn test_round_trip_boundaries() {
        for len in [0, 1, 7, 12, MAX_MSG_DATA_SIZE - 1, MAX_MSG_DATA_SIZE] {
            let msg = sample(len);
            let native = msg.to_native().unwrap();
            assert_eq!(native.data_size as usize, len);
            assert_eq!(Message::from_native(&native).unwrap(), msg, "len {}", len);
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let err = sample(MAX_MSG_DATA_SIZE + 1).to_native().unwrap_err();
        assert_eq!(
            err,
            PassThruError::MessageTooLarge {
                size: 4029,
                max: 4028
            }
        );
    }

    #[test]
    fn test_reserved_bytes_zeroed() {
        let native = sample(3).to_native().unwrap();
        assert!(native.data[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_native_field_placement() {
        let native = sample(2).to_native().unwrap();
        assert_eq!(native.protocol_id, 3);
        assert_eq!(native.rx_status, 0x02);
        assert_eq!(native.tx_flags, 0x200);
        assert_eq!(native.timestamp, 0xDEAD_BEEF);
        assert_eq!(native.extra_data_index, 1);
    }

    #[test]
    fn test_unknown_flag_bits_survive() {
        let mut native = sample(1).to_native().unwrap();
        native.rx_status = 0x8000_0002;
        let msg = Message::from_native(&native).unwrap();
        assert_eq!(msg.rx_status.bits(), 0x8000_0002);
        assert!(msg.rx_status.contains(RxStatus::START_OF_MESSAGE));
    }

    #[test]
    fn test_decode_rejects_bad_driver_data() {
        let mut native = PassThruMsg {
            protocol_id: ProtocolId::Can.raw(),
            data_size: PASSTHRU_DATA_SIZE as u32 + 1,
            ..Default::default()
        };
        assert!(matches!(
            Message::from_native(&native),
            Err(PassThruError::Malformed(_))
        ));

        native.data_size = 4;
        native.protocol_id = 0x42;
        assert!(matches!(
            Message::from_native(&native),
            Err(PassThruError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_reported_never_over_reads() {
        let mut buffer = vec![PassThruMsg::default(); 3];
        for (i, slot) in buffer.iter_mut().enumerate() {
            *slot = Message::can(0x7E0 + i as u32, &[i as u8]).to_native().unwrap();
        }
        // Slot 2 holds garbage the driver never reported
        buffer[2].protocol_id = 0xFFFF;

        let msgs = decode_reported(&buffer, 2).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].can_id(), Some(0x7E1));

        // A driver over-reporting its count is clamped to the buffer
        assert_eq!(decode_reported(&buffer[..2], 10).unwrap().len(), 2);
    }

    #[test]
    fn test_iso15765_message() {
        let msg = Message::iso15765(0x7B3, &[0x22, 0xF1, 0x90]);
        assert_eq!(msg.protocol, ProtocolId::Iso15765);
        assert_eq!(msg.tx_flags, TxFlags::ISO15765_FRAME_PAD);
        assert_eq!(msg.data_size(), 7); // 4 header + 3 payload
        assert_eq!(&msg.data[0..4], &[0x00, 0x00, 0x07, 0xB3]);
        assert_eq!(msg.payload(), &[0x22, 0xF1, 0x90]);
        assert_eq!(msg.can_id(), Some(0x7B3));
    }

    #[test]
    fn test_can_message_keeps_whole_payload() {
        let payload: Vec<u8> = (0..12).collect();
        let msg = Message::can(0x7E0, &payload);
        assert_eq!(msg.data_size(), 16);
        assert_eq!(msg.payload(), payload.as_slice());
        assert_eq!(msg.extra_data_index, 16);
    }

    #[test]
    fn test_short_message_has_no_can_id() {
        let msg = Message::new(ProtocolId::Iso9141, &[0x68, 0x6A]);
        assert_eq!(msg.can_id(), None);
        assert!(msg.payload().is_empty());
        assert_eq!(msg.extra_data_index, 2);
    }

    #[test]
    fn test_empty_batch_encodes() {
        assert!(encode_all(&[]).unwrap().is_empty());
        let err = encode_all(&[sample(1), sample(5000)]).unwrap_err();
        assert!(matches!(err, PassThruError::MessageTooLarge { size: 5000, .. }));
    }
}
