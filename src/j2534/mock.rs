use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ffi::{c_void, CStr};

use crate::j2534::error::Operation;
use crate::j2534::message::Message;
use crate::j2534::types::*;
use crate::j2534::PassThruApi;

/// One native call as the driver saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open { name: Option<String> },
    Close { device: u32 },
    Connect { device: u32, protocol: u32, flags: u32, baud: u32 },
    Disconnect { channel: u32 },
    ReadMsgs { channel: u32, requested: u32, timeout: u32 },
    WriteMsgs { channel: u32, requested: u32, timeout: u32 },
    StartPeriodicMsg { channel: u32, interval: u32 },
    StopPeriodicMsg { channel: u32, msg: u32 },
    StartMsgFilter { channel: u32, filter_type: u32, flow_control: bool },
    StopMsgFilter { channel: u32, filter: u32 },
    SetProgrammingVoltage { device: u32, pin: u32, voltage: u32 },
    ReadVersion { device: u32 },
    GetLastError,
    Ioctl { handle: u32, ioctl_id: u32 },
}

impl Call {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Open { .. } => Operation::Open,
            Self::Close { .. } => Operation::Close,
            Self::Connect { .. } => Operation::Connect,
            Self::Disconnect { .. } => Operation::Disconnect,
            Self::ReadMsgs { .. } => Operation::ReadMsgs,
            Self::WriteMsgs { .. } => Operation::WriteMsgs,
            Self::StartPeriodicMsg { .. } => Operation::StartPeriodicMsg,
            Self::StopPeriodicMsg { .. } => Operation::StopPeriodicMsg,
            Self::StartMsgFilter { .. } => Operation::StartMsgFilter,
            Self::StopMsgFilter { .. } => Operation::StopMsgFilter,
            Self::SetProgrammingVoltage { .. } => Operation::SetProgrammingVoltage,
            Self::ReadVersion { .. } => Operation::ReadVersion,
            Self::GetLastError => Operation::GetLastError,
            Self::Ioctl { .. } => Operation::Ioctl,
        }
    }
}

/// Mock J2534 driver for testing the session without hardware.
///
/// Records every call, hands out ids from a counter (or a scripted queue),
/// echoes SET_CONFIG values back through GET_CONFIG and serves queued
/// receive messages. Any operation can be made to fail with a given status.
pub struct MockDriver {
    calls: RefCell<Vec<Call>>,
    next_id: Cell<u32>,
    scripted_ids: RefCell<VecDeque<u32>>,
    failures: RefCell<HashMap<Operation, VecDeque<u32>>>,
    /// Values returned by GET_CONFIG for parameters never set on a channel
    config_defaults: RefCell<BTreeMap<u32, u32>>,
    /// (channel, parameter) → value
    config: RefCell<BTreeMap<(u32, u32), u32>>,
    rx_queue: RefCell<VecDeque<Message>>,
    written: RefCell<Vec<Message>>,
    /// Max messages accepted per WriteMsgs call
    write_limit: Cell<Option<u32>>,
    last_error: RefCell<String>,
    vbatt_mv: Cell<u32>,
    prog_voltage_mv: Cell<u32>,
    key_bytes: RefCell<Vec<u8>>,
    fast_init_response: RefCell<Option<Message>>,
    funct_table: RefCell<BTreeMap<u32, BTreeSet<u8>>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
            scripted_ids: RefCell::new(VecDeque::new()),
            failures: RefCell::new(HashMap::new()),
            config_defaults: RefCell::new(BTreeMap::new()),
            config: RefCell::new(BTreeMap::new()),
            rx_queue: RefCell::new(VecDeque::new()),
            written: RefCell::new(Vec::new()),
            write_limit: Cell::new(None),
            last_error: RefCell::new(String::new()),
            vbatt_mv: Cell::new(12_600),
            prog_voltage_mv: Cell::new(0),
            key_bytes: RefCell::new(vec![0x08, 0x08]),
            fast_init_response: RefCell::new(None),
            funct_table: RefCell::new(BTreeMap::new()),
        }
    }

    /// Every call made so far
    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }

    /// Calls made to one entry point
    pub fn calls_to(&self, operation: Operation) -> Vec<Call> {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.operation() == operation)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    /// Ids handed out by the next Open/Connect/Start* calls, before the counter resumes
    pub fn script_ids(&self, ids: impl IntoIterator<Item = u32>) {
        self.scripted_ids.borrow_mut().extend(ids);
    }

    /// Makes the next call to `operation` return `status` without doing anything
    pub fn fail_next(&self, operation: Operation, status: u32) {
        self.failures
            .borrow_mut()
            .entry(operation)
            .or_default()
            .push_back(status);
    }

    pub fn set_config_default(&self, parameter: IoctlParameter, value: u32) {
        self.config_defaults
            .borrow_mut()
            .insert(parameter.raw(), value);
    }

    pub fn config_value(&self, channel: u32, parameter: IoctlParameter) -> Option<u32> {
        self.config.borrow().get(&(channel, parameter.raw())).copied()
    }

    pub fn queue_rx(&self, msg: Message) {
        self.rx_queue.borrow_mut().push_back(msg);
    }

    pub fn rx_pending(&self) -> usize {
        self.rx_queue.borrow().len()
    }

    /// Messages accepted by WriteMsgs
    pub fn written(&self) -> Vec<Message> {
        self.written.borrow().clone()
    }

    pub fn set_write_limit(&self, limit: u32) {
        self.write_limit.set(Some(limit));
    }

    pub fn set_last_error(&self, text: &str) {
        *self.last_error.borrow_mut() = text.to_string();
    }

    pub fn set_vbatt(&self, millivolts: u32) {
        self.vbatt_mv.set(millivolts);
    }

    pub fn set_key_bytes(&self, bytes: &[u8]) {
        *self.key_bytes.borrow_mut() = bytes.to_vec();
    }

    pub fn set_fast_init_response(&self, msg: Message) {
        *self.fast_init_response.borrow_mut() = Some(msg);
    }

    pub fn funct_table(&self, channel: u32) -> Vec<u8> {
        self.funct_table
            .borrow()
            .get(&channel)
            .map(|t| t.iter().copied().collect())
            .unwrap_or_default()
    }

    fn record(&self, call: Call) -> Option<u32> {
        let operation = call.operation();
        self.calls.borrow_mut().push(call);
        self.failures
            .borrow_mut()
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
    }

    fn issue_id(&self) -> u32 {
        if let Some(id) = self.scripted_ids.borrow_mut().pop_front() {
            return id;
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    unsafe fn config_ioctl(&self, channel: u32, ioctl_id: IoctlId, input: *mut c_void) -> u32 {
        let Some(list) = (input as *const SConfigList).as_ref() else {
            return ErrorId::NullParameter.raw();
        };
        let configs = std::slice::from_raw_parts_mut(list.config_ptr, list.num_of_params as usize);
        let mut store = self.config.borrow_mut();
        for config in configs {
            if ioctl_id == IoctlId::SetConfig {
                store.insert((channel, config.parameter), config.value);
            } else {
                config.value = store
                    .get(&(channel, config.parameter))
                    .copied()
                    .unwrap_or_else(|| {
                        self.config_defaults
                            .borrow()
                            .get(&config.parameter)
                            .copied()
                            .unwrap_or(0)
                    });
            }
        }
        STATUS_NOERROR
    }

    unsafe fn byte_array<'a>(ptr: *mut c_void) -> Option<&'a mut [u8]> {
        let array = (ptr as *const SByteArray).as_ref()?;
        Some(std::slice::from_raw_parts_mut(
            array.byte_ptr,
            array.num_of_bytes as usize,
        ))
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl PassThruApi for MockDriver {
    fn open(&self, name: Option<&CStr>, device_id: &mut u32) -> u32 {
        let name = name.map(|n| n.to_string_lossy().into_owned());
        if let Some(status) = self.record(Call::Open { name }) {
            return status;
        }
        *device_id = self.issue_id();
        STATUS_NOERROR
    }

    fn close(&self, device: u32) -> u32 {
        self.record(Call::Close { device }).unwrap_or(STATUS_NOERROR)
    }

    fn connect(
        &self,
        device: u32,
        protocol: u32,
        flags: u32,
        baud: u32,
        channel_id: &mut u32,
    ) -> u32 {
        if let Some(status) = self.record(Call::Connect {
            device,
            protocol,
            flags,
            baud,
        }) {
            return status;
        }
        let channel = self.issue_id();
        self.config
            .borrow_mut()
            .insert((channel, IoctlParameter::DataRate.raw()), baud);
        *channel_id = channel;
        STATUS_NOERROR
    }

    fn disconnect(&self, channel: u32) -> u32 {
        self.record(Call::Disconnect { channel })
            .unwrap_or(STATUS_NOERROR)
    }

    fn read_msgs(
        &self,
        channel: u32,
        msgs: &mut [PassThruMsg],
        num_msgs: &mut u32,
        timeout: u32,
    ) -> u32 {
        let requested = (*num_msgs).min(msgs.len() as u32);
        if let Some(status) = self.record(Call::ReadMsgs {
            channel,
            requested,
            timeout,
        }) {
            *num_msgs = 0;
            return status;
        }
        let mut queue = self.rx_queue.borrow_mut();
        let mut read = 0;
        while read < requested {
            let Some(msg) = queue.pop_front() else { break };
            match msg.to_native() {
                Ok(native) => msgs[read as usize] = native,
                Err(_) => return ErrorId::Failed.raw(),
            }
            read += 1;
        }
        *num_msgs = read;
        if read == 0 {
            ErrorId::BufferEmpty.raw()
        } else if read < requested && timeout > 0 {
            ErrorId::Timeout.raw()
        } else {
            STATUS_NOERROR
        }
    }

    fn write_msgs(
        &self,
        channel: u32,
        msgs: &[PassThruMsg],
        num_msgs: &mut u32,
        timeout: u32,
    ) -> u32 {
        let requested = (*num_msgs).min(msgs.len() as u32);
        if let Some(status) = self.record(Call::WriteMsgs {
            channel,
            requested,
            timeout,
        }) {
            *num_msgs = 0;
            return status;
        }
        let accepted = self.write_limit.get().map_or(requested, |l| l.min(requested));
        let mut written = self.written.borrow_mut();
        for msg in &msgs[..accepted as usize] {
            match Message::from_native(msg) {
                Ok(msg) => written.push(msg),
                Err(_) => return ErrorId::InvalidMsg.raw(),
            }
        }
        *num_msgs = accepted;
        STATUS_NOERROR
    }

    fn start_periodic_msg(
        &self,
        channel: u32,
        _msg: &PassThruMsg,
        msg_id: &mut u32,
        interval: u32,
    ) -> u32 {
        if let Some(status) = self.record(Call::StartPeriodicMsg { channel, interval }) {
            return status;
        }
        *msg_id = self.issue_id();
        STATUS_NOERROR
    }

    fn stop_periodic_msg(&self, channel: u32, msg: u32) -> u32 {
        self.record(Call::StopPeriodicMsg { channel, msg })
            .unwrap_or(STATUS_NOERROR)
    }

    fn start_msg_filter(
        &self,
        channel: u32,
        filter_type: u32,
        _mask: &PassThruMsg,
        _pattern: &PassThruMsg,
        flow_control: Option<&PassThruMsg>,
        filter_id: &mut u32,
    ) -> u32 {
        if let Some(status) = self.record(Call::StartMsgFilter {
            channel,
            filter_type,
            flow_control: flow_control.is_some(),
        }) {
            return status;
        }
        *filter_id = self.issue_id();
        STATUS_NOERROR
    }

    fn stop_msg_filter(&self, channel: u32, filter: u32) -> u32 {
        self.record(Call::StopMsgFilter { channel, filter })
            .unwrap_or(STATUS_NOERROR)
    }

    fn set_programming_voltage(&self, device: u32, pin: u32, voltage: u32) -> u32 {
        if let Some(status) = self.record(Call::SetProgrammingVoltage {
            device,
            pin,
            voltage,
        }) {
            return status;
        }
        // Short-to-ground and off both read back as 0 mV
        if ProgrammingVoltage::Millivolts(voltage).is_valid() {
            self.prog_voltage_mv.set(voltage);
        } else {
            self.prog_voltage_mv.set(0);
        }
        STATUS_NOERROR
    }

    fn read_version(
        &self,
        device: u32,
        firmware: &mut [u8; PASSTHRU_TEXT_SIZE],
        dll: &mut [u8; PASSTHRU_TEXT_SIZE],
        api: &mut [u8; PASSTHRU_TEXT_SIZE],
    ) -> u32 {
        if let Some(status) = self.record(Call::ReadVersion { device }) {
            return status;
        }
        for (buf, text) in [(firmware, "1.2.3"), (dll, "mock 0.1"), (api, "04.04")] {
            buf[..text.len()].copy_from_slice(text.as_bytes());
        }
        STATUS_NOERROR
    }

    fn get_last_error(&self, description: &mut [u8; PASSTHRU_TEXT_SIZE]) -> u32 {
        if let Some(status) = self.record(Call::GetLastError) {
            return status;
        }
        let text = self.last_error.borrow();
        let len = text.len().min(PASSTHRU_TEXT_SIZE - 1);
        description[..len].copy_from_slice(&text.as_bytes()[..len]);
        description[len] = 0;
        STATUS_NOERROR
    }

    unsafe fn ioctl(
        &self,
        handle: u32,
        ioctl_id: u32,
        input: *mut c_void,
        output: *mut c_void,
    ) -> u32 {
        if let Some(status) = self.record(Call::Ioctl { handle, ioctl_id }) {
            return status;
        }
        let Some(id) = IoctlId::from_raw(ioctl_id) else {
            return ErrorId::InvalidIoctlId.raw();
        };
        match id {
            IoctlId::GetConfig | IoctlId::SetConfig => self.config_ioctl(handle, id, input),
            IoctlId::ReadVbatt | IoctlId::ReadProgVoltage => {
                let Some(out) = (output as *mut u32).as_mut() else {
                    return ErrorId::NullParameter.raw();
                };
                *out = if id == IoctlId::ReadVbatt {
                    self.vbatt_mv.get()
                } else {
                    self.prog_voltage_mv.get()
                };
                STATUS_NOERROR
            }
            IoctlId::FiveBaudInit => {
                let (Some(address), Some(array)) =
                    (Self::byte_array(input), (output as *mut SByteArray).as_mut())
                else {
                    return ErrorId::NullParameter.raw();
                };
                if address.len() != 1 {
                    return ErrorId::InvalidMsg.raw();
                }
                let keys = self.key_bytes.borrow();
                let len = keys.len().min(array.num_of_bytes as usize);
                std::slice::from_raw_parts_mut(array.byte_ptr, len).copy_from_slice(&keys[..len]);
                array.num_of_bytes = len as u32;
                STATUS_NOERROR
            }
            IoctlId::FastInit => {
                let (Some(_), Some(out)) = (
                    (input as *const PassThruMsg).as_ref(),
                    (output as *mut PassThruMsg).as_mut(),
                ) else {
                    return ErrorId::NullParameter.raw();
                };
                match self.fast_init_response.borrow().as_ref().map(Message::to_native) {
                    Some(Ok(response)) => *out = response,
                    Some(Err(_)) => return ErrorId::Failed.raw(),
                    None => out.data_size = 0,
                }
                STATUS_NOERROR
            }
            IoctlId::ClearRxBuffer => {
                self.rx_queue.borrow_mut().clear();
                STATUS_NOERROR
            }
            IoctlId::ClearTxBuffer | IoctlId::ClearPeriodicMsgs | IoctlId::ClearMsgFilters => {
                STATUS_NOERROR
            }
            IoctlId::ClearFunctMsgLookupTable => {
                self.funct_table.borrow_mut().remove(&handle);
                STATUS_NOERROR
            }
            IoctlId::AddToFunctMsgLookupTable | IoctlId::DeleteFromFunctMsgLookupTable => {
                let Some(addresses) = Self::byte_array(input) else {
                    return ErrorId::NullParameter.raw();
                };
                let mut tables = self.funct_table.borrow_mut();
                let table = tables.entry(handle).or_default();
                for address in addresses.iter() {
                    if id == IoctlId::AddToFunctMsgLookupTable {
                        table.insert(*address);
                    } else {
                        table.remove(address);
                    }
                }
                STATUS_NOERROR
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_count_up_then_follow_script() {
        let mock = MockDriver::new();
        let mut id = 0;
        mock.open(None, &mut id);
        assert_eq!(id, 1);
        mock.script_ids([1, 1]);
        mock.connect(1, 5, 0, 500_000, &mut id);
        assert_eq!(id, 1);
        mock.connect(1, 5, 0, 500_000, &mut id);
        assert_eq!(id, 1);
        mock.connect(1, 5, 0, 500_000, &mut id);
        assert_eq!(id, 2);
    }

    #[test]
    fn test_failure_is_one_shot() {
        let mock = MockDriver::new();
        mock.fail_next(Operation::Close, ErrorId::InvalidDeviceId.raw());
        assert_eq!(mock.close(1), 0x1A);
        assert_eq!(mock.close(1), STATUS_NOERROR);
        assert_eq!(mock.calls_to(Operation::Close).len(), 2);
    }

    #[test]
    fn test_read_reports_buffer_empty() {
        let mock = MockDriver::new();
        let mut buffer = vec![PassThruMsg::default(); 4];
        let mut count = 4;
        assert_eq!(
            mock.read_msgs(1, &mut buffer, &mut count, 0),
            ErrorId::BufferEmpty.raw()
        );
        assert_eq!(count, 0);

        mock.queue_rx(Message::can(0x7E8, &[0x02, 0x50, 0x01]));
        count = 4;
        assert_eq!(
            mock.read_msgs(1, &mut buffer, &mut count, 50),
            ErrorId::Timeout.raw()
        );
        assert_eq!(count, 1);
        assert_eq!(buffer[0].data_size, 7);
    }

    #[test]
    fn test_get_config_uses_defaults_and_echo() {
        let mock = MockDriver::new();
        mock.set_config_default(IoctlParameter::P1Max, 40);
        let mut configs = [
            SConfig {
                parameter: IoctlParameter::P1Max.raw(),
                value: 0,
            },
            SConfig {
                parameter: IoctlParameter::Loopback.raw(),
                value: 7,
            },
        ];
        let mut list = SConfigList::new(&mut configs);
        let status = unsafe {
            mock.ioctl(
                3,
                IoctlId::GetConfig.raw(),
                &mut list as *mut SConfigList as *mut c_void,
                std::ptr::null_mut(),
            )
        };
        assert_eq!(status, STATUS_NOERROR);
        assert_eq!(configs[0].value, 40);
        assert_eq!(configs[1].value, 0);
    }

    #[test]
    fn test_unknown_ioctl_rejected() {
        let mock = MockDriver::new();
        let status = unsafe { mock.ioctl(1, 0x06, std::ptr::null_mut(), std::ptr::null_mut()) };
        assert_eq!(status, ErrorId::InvalidIoctlId.raw());
    }
}
