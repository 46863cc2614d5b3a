use std::ffi::{c_void, CString};
use std::ptr;
use std::sync::Arc;

use serde::Deserialize;

use crate::j2534::discover::{DriverDescriptor, PointerWidth};
use crate::j2534::dll::J2534Lib;
use crate::j2534::error::{last_error_text, translate, Operation, PassThruError, Result};
use crate::j2534::handles::{
    ChannelHandle, DeviceHandle, FilterHandle, HandleTree, PeriodicMsgHandle,
};
use crate::j2534::ioctl::{self, ConfigValues};
use crate::j2534::message::{decode_reported, encode_all, Message};
use crate::j2534::types::*;
use crate::j2534::PassThruApi;

/// Valid PassThruStartPeriodicMsg intervals, in ms
pub const PERIODIC_INTERVAL_MS: std::ops::RangeInclusive<u32> = 5..=65535;

/// Most messages one [`PassThruSession::read_msgs`] call may ask for
pub const MAX_READ_MSGS: u32 = 1024;

/// Number of key bytes returned by FIVE_BAUD_INIT
const FIVE_BAUD_KEY_BYTES: usize = 2;

/// Session behaviour knobs
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Ask PassThruGetLastError for a description whenever a call fails
    pub fetch_error_text: bool,
    /// Name passed to PassThruOpen by [`PassThruSession::open`]
    pub device_name: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fetch_error_text: true,
            device_name: None,
        }
    }
}

/// Handle a raw ioctl is issued against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlTarget {
    Device(DeviceHandle),
    Channel(ChannelHandle),
}

impl From<DeviceHandle> for IoctlTarget {
    fn from(h: DeviceHandle) -> Self {
        Self::Device(h)
    }
}

impl From<ChannelHandle> for IoctlTarget {
    fn from(h: ChannelHandle) -> Self {
        Self::Channel(h)
    }
}

/// Stateful wrapper around one loaded J2534 driver.
///
/// Tracks every handle the driver issued and checks it before each call, so
/// a closed device or disconnected channel (and everything beneath it) is
/// rejected with `StaleHandle` instead of reaching the driver. Dropping the
/// session stops periodic messages, removes filters, disconnects channels,
/// closes devices and finally releases the driver, in that order.
pub struct PassThruSession<A: PassThruApi = J2534Lib> {
    driver: Option<Arc<A>>,
    config: SessionConfig,
    handles: HandleTree,
}

impl PassThruSession<J2534Lib> {
    /// Load the driver a descriptor points at
    pub fn load(descriptor: &DriverDescriptor) -> Result<Self> {
        Self::load_with_config(descriptor, SessionConfig::default())
    }

    pub fn load_with_config(descriptor: &DriverDescriptor, config: SessionConfig) -> Result<Self> {
        let host = PointerWidth::host();
        if descriptor.width != host {
            return Err(PassThruError::DriverLoad {
                path: descriptor.library_path.display().to_string(),
                reason: format!("{} driver cannot be loaded into a {} process", descriptor.width, host),
            });
        }
        let lib = J2534Lib::load(&descriptor.library_path)?;
        log::info!("J2534 session ready for {}", descriptor.name);
        Ok(Self::with_config(Arc::new(lib), config))
    }
}

impl<A: PassThruApi> PassThruSession<A> {
    pub fn new(driver: Arc<A>) -> Self {
        Self::with_config(driver, SessionConfig::default())
    }

    pub fn with_config(driver: Arc<A>, config: SessionConfig) -> Self {
        Self {
            driver: Some(driver),
            config,
            handles: HandleTree::default(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The loaded driver, or `None` after [`unload`](Self::unload)
    pub fn driver(&self) -> Option<&Arc<A>> {
        self.driver.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.driver.is_some()
    }

    fn api(&self) -> Result<Arc<A>> {
        self.driver.clone().ok_or(PassThruError::DriverUnloaded)
    }

    fn check(&self, api: &A, operation: Operation, status: u32) -> Result<()> {
        let fetch = self.config.fetch_error_text;
        translate(operation, status, || {
            if fetch {
                last_error_text(api)
            } else {
                String::new()
            }
        })
    }

    // -- Devices --

    /// Open the default device, or the one named in [`SessionConfig::device_name`]
    pub fn open(&mut self) -> Result<DeviceHandle> {
        let name = self.config.device_name.clone();
        self.open_inner(name.as_deref())
    }

    /// Open a device by name
    pub fn open_named(&mut self, name: &str) -> Result<DeviceHandle> {
        self.open_inner(Some(name))
    }

    fn open_inner(&mut self, name: Option<&str>) -> Result<DeviceHandle> {
        let api = self.api()?;
        let name = name
            .map(CString::new)
            .transpose()
            .map_err(|_| PassThruError::InvalidArgument("device name contains a NUL byte".into()))?;
        let mut raw = 0;
        let status = api.open(name.as_deref(), &mut raw);
        self.check(&api, Operation::Open, status)?;
        let device = self.handles.insert_device(raw);
        log::info!("Opened J2534 device {}", raw);
        Ok(device)
    }

    /// Close a device; its channels, filters and periodic messages go with it
    pub fn close(&mut self, device: DeviceHandle) -> Result<()> {
        let api = self.api()?;
        self.handles.check_device(device)?;
        let status = api.close(device.raw());
        self.check(&api, Operation::Close, status)?;
        self.handles.remove_device(device);
        log::info!("Closed J2534 device {}", device.raw());
        Ok(())
    }

    pub fn read_version(&mut self, device: DeviceHandle) -> Result<DeviceVersion> {
        let api = self.api()?;
        self.handles.check_device(device)?;
        let mut firmware = [0u8; PASSTHRU_TEXT_SIZE];
        let mut dll = [0u8; PASSTHRU_TEXT_SIZE];
        let mut api_version = [0u8; PASSTHRU_TEXT_SIZE];
        let status = api.read_version(device.raw(), &mut firmware, &mut dll, &mut api_version);
        self.check(&api, Operation::ReadVersion, status)?;
        Ok(DeviceVersion {
            firmware: c_text(&firmware),
            dll: c_text(&dll),
            api: c_text(&api_version),
        })
    }

    /// Text describing the driver's most recent failure
    pub fn get_last_error(&self) -> Result<String> {
        let api = self.api()?;
        let mut text = [0u8; PASSTHRU_TEXT_SIZE];
        let status = api.get_last_error(&mut text);
        translate(Operation::GetLastError, status, String::new)?;
        Ok(c_text(&text))
    }

    pub fn set_programming_voltage(
        &mut self,
        device: DeviceHandle,
        pin: ProgrammingPin,
        voltage: ProgrammingVoltage,
    ) -> Result<()> {
        let api = self.api()?;
        self.handles.check_device(device)?;
        if !voltage.is_valid() {
            return Err(PassThruError::InvalidArgument(format!(
                "programming voltage {:?} outside {}..={} mV",
                voltage,
                ProgrammingVoltage::MIN_MILLIVOLTS,
                ProgrammingVoltage::MAX_MILLIVOLTS
            )));
        }
        let status = api.set_programming_voltage(device.raw(), pin.raw(), voltage.raw());
        self.check(&api, Operation::SetProgrammingVoltage, status)
    }

    /// Voltage on pin 16 of the vehicle connector, in mV
    pub fn read_vbatt(&mut self, device: DeviceHandle) -> Result<u32> {
        self.read_u32_ioctl(device, IoctlId::ReadVbatt)
    }

    /// Current programming voltage, in mV
    pub fn read_prog_voltage(&mut self, device: DeviceHandle) -> Result<u32> {
        self.read_u32_ioctl(device, IoctlId::ReadProgVoltage)
    }

    fn read_u32_ioctl(&self, device: DeviceHandle, ioctl_id: IoctlId) -> Result<u32> {
        let api = self.api()?;
        self.handles.check_device(device)?;
        let mut value: u32 = 0;
        let status = unsafe {
            api.ioctl(
                device.raw(),
                ioctl_id.raw(),
                ptr::null_mut(),
                &mut value as *mut u32 as *mut c_void,
            )
        };
        self.check(&api, Operation::Ioctl, status)?;
        Ok(value)
    }

    // -- Channels --

    pub fn connect(
        &mut self,
        device: DeviceHandle,
        protocol: ProtocolId,
        flags: ConnectFlags,
        baud_rate: u32,
    ) -> Result<ChannelHandle> {
        let api = self.api()?;
        self.handles.check_device(device)?;
        let mut raw = 0;
        let status = api.connect(
            device.raw(),
            protocol.raw(),
            flags.bits(),
            baud_rate,
            &mut raw,
        );
        self.check(&api, Operation::Connect, status)?;
        let channel = self.handles.insert_channel(device, raw, protocol)?;
        log::info!(
            "Connected {} channel {} at {} baud (flags 0x{:X})",
            protocol,
            raw,
            baud_rate,
            flags.bits()
        );
        Ok(channel)
    }

    /// Disconnect a channel; its filters and periodic messages go with it
    pub fn disconnect(&mut self, channel: ChannelHandle) -> Result<()> {
        let api = self.api()?;
        self.handles.check_channel(channel)?;
        let status = api.disconnect(channel.raw());
        self.check(&api, Operation::Disconnect, status)?;
        self.handles.remove_channel(channel);
        log::info!("Disconnected channel {}", channel.raw());
        Ok(())
    }

    /// Protocol the channel was connected with
    pub fn channel_protocol(&self, channel: ChannelHandle) -> Result<ProtocolId> {
        self.handles.channel_protocol(channel)
    }

    /// Read up to `max_msgs` messages, waiting at most `timeout_ms`.
    ///
    /// An empty buffer or an expired timeout is not an error: whatever
    /// arrived (possibly nothing) is returned. `max_msgs` above
    /// [`MAX_READ_MSGS`] is rejected with `InvalidArgument`.
    pub fn read_msgs(
        &mut self,
        channel: ChannelHandle,
        max_msgs: u32,
        timeout_ms: u32,
    ) -> Result<Vec<Message>> {
        let api = self.api()?;
        self.handles.check_channel(channel)?;
        if max_msgs == 0 {
            return Ok(Vec::new());
        }
        if max_msgs > MAX_READ_MSGS {
            return Err(PassThruError::InvalidArgument(format!(
                "cannot read {} messages at once, at most {}",
                max_msgs, MAX_READ_MSGS
            )));
        }
        let mut buffer = vec![PassThruMsg::default(); max_msgs as usize];
        let mut count = max_msgs;
        let status = api.read_msgs(channel.raw(), &mut buffer, &mut count, timeout_ms);
        match ErrorId::from_raw(status) {
            Some(ErrorId::BufferEmpty) | Some(ErrorId::Timeout) => {}
            _ => self.check(&api, Operation::ReadMsgs, status)?,
        }
        let msgs = decode_reported(&buffer, count)?;
        log::debug!("RX {} of {} message(s) on channel {}", msgs.len(), max_msgs, channel.raw());
        Ok(msgs)
    }

    /// Queue messages for transmission. Returns how many the driver accepted,
    /// which may be fewer than given when the timeout expires.
    pub fn write_msgs(
        &mut self,
        channel: ChannelHandle,
        msgs: &[Message],
        timeout_ms: u32,
    ) -> Result<u32> {
        let api = self.api()?;
        self.handles.check_channel(channel)?;
        let native = encode_all(msgs)?;
        if native.is_empty() {
            return Ok(0);
        }
        let mut count = native.len() as u32;
        let status = api.write_msgs(channel.raw(), &native, &mut count, timeout_ms);
        if ErrorId::from_raw(status) != Some(ErrorId::Timeout) {
            self.check(&api, Operation::WriteMsgs, status)?;
        }
        log::debug!("TX {} of {} message(s) on channel {}", count, native.len(), channel.raw());
        Ok(count)
    }

    // -- Filters --

    pub fn start_msg_filter(
        &mut self,
        channel: ChannelHandle,
        filter_type: FilterType,
        mask: &Message,
        pattern: &Message,
        flow_control: Option<&Message>,
    ) -> Result<FilterHandle> {
        let api = self.api()?;
        self.handles.check_channel(channel)?;
        match (filter_type, flow_control) {
            (FilterType::FlowControl, None) => {
                return Err(PassThruError::InvalidArgument(
                    "FLOW_CONTROL_FILTER needs a flow control message".into(),
                ))
            }
            (FilterType::Pass | FilterType::Block, Some(_)) => {
                return Err(PassThruError::InvalidArgument(format!(
                    "{} takes no flow control message",
                    filter_type
                )))
            }
            _ => {}
        }
        let mask = mask.to_native()?;
        let pattern = pattern.to_native()?;
        let flow_control = flow_control.map(Message::to_native).transpose()?;

        let mut raw = 0;
        let status = api.start_msg_filter(
            channel.raw(),
            filter_type.raw(),
            &mask,
            &pattern,
            flow_control.as_ref(),
            &mut raw,
        );
        self.check(&api, Operation::StartMsgFilter, status)?;
        let filter = self.handles.insert_filter(channel, raw)?;
        log::debug!("Started {} {} on channel {}", filter_type, raw, channel.raw());
        Ok(filter)
    }

    pub fn stop_msg_filter(&mut self, filter: FilterHandle) -> Result<()> {
        let api = self.api()?;
        self.handles.check_filter(filter)?;
        let status = api.stop_msg_filter(filter.channel_raw(), filter.raw());
        self.check(&api, Operation::StopMsgFilter, status)?;
        self.handles.remove_filter(filter);
        Ok(())
    }

    // -- Periodic messages --

    pub fn start_periodic_msg(
        &mut self,
        channel: ChannelHandle,
        msg: &Message,
        interval_ms: u32,
    ) -> Result<PeriodicMsgHandle> {
        let api = self.api()?;
        self.handles.check_channel(channel)?;
        if !PERIODIC_INTERVAL_MS.contains(&interval_ms) {
            return Err(PassThruError::InvalidArgument(format!(
                "periodic interval {} ms outside {}..={} ms",
                interval_ms,
                PERIODIC_INTERVAL_MS.start(),
                PERIODIC_INTERVAL_MS.end()
            )));
        }
        let native = msg.to_native()?;
        let mut raw = 0;
        let status = api.start_periodic_msg(channel.raw(), &native, &mut raw, interval_ms);
        self.check(&api, Operation::StartPeriodicMsg, status)?;
        let periodic = self.handles.insert_periodic(channel, raw)?;
        log::debug!(
            "Started periodic message {} every {} ms on channel {}",
            raw,
            interval_ms,
            channel.raw()
        );
        Ok(periodic)
    }

    pub fn stop_periodic_msg(&mut self, msg: PeriodicMsgHandle) -> Result<()> {
        let api = self.api()?;
        self.handles.check_periodic(msg)?;
        let status = api.stop_periodic_msg(msg.channel_raw(), msg.raw());
        self.check(&api, Operation::StopPeriodicMsg, status)?;
        self.handles.remove_periodic(msg);
        Ok(())
    }

    // -- Ioctl --

    /// GET_CONFIG: current values of `parameters`, iterated in the order asked
    pub fn get_config(
        &mut self,
        channel: ChannelHandle,
        parameters: &[IoctlParameter],
    ) -> Result<ConfigValues> {
        let api = self.api()?;
        self.handles.check_channel(channel)?;
        let mut configs = ioctl::query_list(parameters)?;
        if configs.is_empty() {
            return Ok(ConfigValues::new());
        }
        ioctl::warn_reserved(parameters.iter().copied());
        let mut list = SConfigList::new(&mut configs);
        let status = unsafe {
            api.ioctl(
                channel.raw(),
                IoctlId::GetConfig.raw(),
                &mut list as *mut SConfigList as *mut c_void,
                ptr::null_mut(),
            )
        };
        self.check(&api, Operation::Ioctl, status)?;
        ConfigValues::from_native(&configs)
    }

    /// SET_CONFIG. A driver that rejects one parameter may or may not have
    /// applied the ones before it; only the overall status is reported.
    pub fn set_config(&mut self, channel: ChannelHandle, values: &ConfigValues) -> Result<()> {
        let api = self.api()?;
        self.handles.check_channel(channel)?;
        if values.is_empty() {
            return Ok(());
        }
        ioctl::warn_reserved(values.parameters());
        let mut configs = values.to_native();
        let mut list = SConfigList::new(&mut configs);
        let status = unsafe {
            api.ioctl(
                channel.raw(),
                IoctlId::SetConfig.raw(),
                &mut list as *mut SConfigList as *mut c_void,
                ptr::null_mut(),
            )
        };
        self.check(&api, Operation::Ioctl, status)?;
        log::debug!("SET_CONFIG {:?} on channel {}", values, channel.raw());
        Ok(())
    }

    /// ISO9141 / ISO14230 five-baud initialisation; returns the ECU key bytes
    pub fn five_baud_init(&mut self, channel: ChannelHandle, address: u8) -> Result<Vec<u8>> {
        let api = self.api()?;
        self.handles.check_channel(channel)?;
        let mut input_bytes = [address];
        let mut output_bytes = [0u8; FIVE_BAUD_KEY_BYTES];
        let mut input = SByteArray::new(&mut input_bytes);
        let mut output = SByteArray::new(&mut output_bytes);
        let status = unsafe {
            api.ioctl(
                channel.raw(),
                IoctlId::FiveBaudInit.raw(),
                &mut input as *mut SByteArray as *mut c_void,
                &mut output as *mut SByteArray as *mut c_void,
            )
        };
        self.check(&api, Operation::Ioctl, status)?;
        let len = (output.num_of_bytes as usize).min(FIVE_BAUD_KEY_BYTES);
        Ok(output_bytes[..len].to_vec())
    }

    /// ISO14230 fast initialisation; returns the ECU response, if it sent one
    pub fn fast_init(&mut self, channel: ChannelHandle, msg: &Message) -> Result<Option<Message>> {
        let api = self.api()?;
        self.handles.check_channel(channel)?;
        let mut input = msg.to_native()?;
        let mut output = PassThruMsg::default();
        let status = unsafe {
            api.ioctl(
                channel.raw(),
                IoctlId::FastInit.raw(),
                &mut input as *mut PassThruMsg as *mut c_void,
                &mut output as *mut PassThruMsg as *mut c_void,
            )
        };
        self.check(&api, Operation::Ioctl, status)?;
        if output.data_size == 0 {
            return Ok(None);
        }
        Message::from_native(&output).map(Some)
    }

    pub fn clear_tx_buffer(&mut self, channel: ChannelHandle) -> Result<()> {
        self.channel_ioctl(channel, IoctlId::ClearTxBuffer)
    }

    pub fn clear_rx_buffer(&mut self, channel: ChannelHandle) -> Result<()> {
        self.channel_ioctl(channel, IoctlId::ClearRxBuffer)
    }

    /// Stops every periodic message on the channel; their handles become stale
    pub fn clear_periodic_msgs(&mut self, channel: ChannelHandle) -> Result<()> {
        self.channel_ioctl(channel, IoctlId::ClearPeriodicMsgs)?;
        self.handles.clear_periodic(channel)
    }

    /// Removes every filter on the channel; their handles become stale
    pub fn clear_msg_filters(&mut self, channel: ChannelHandle) -> Result<()> {
        self.channel_ioctl(channel, IoctlId::ClearMsgFilters)?;
        self.handles.clear_filters(channel)
    }

    pub fn clear_funct_msg_lookup_table(&mut self, channel: ChannelHandle) -> Result<()> {
        self.channel_ioctl(channel, IoctlId::ClearFunctMsgLookupTable)
    }

    /// J1850PWM functional addresses to receive
    pub fn add_to_funct_msg_lookup_table(
        &mut self,
        channel: ChannelHandle,
        addresses: &[u8],
    ) -> Result<()> {
        self.lookup_table_ioctl(channel, IoctlId::AddToFunctMsgLookupTable, addresses)
    }

    pub fn delete_from_funct_msg_lookup_table(
        &mut self,
        channel: ChannelHandle,
        addresses: &[u8],
    ) -> Result<()> {
        self.lookup_table_ioctl(channel, IoctlId::DeleteFromFunctMsgLookupTable, addresses)
    }

    fn lookup_table_ioctl(
        &mut self,
        channel: ChannelHandle,
        ioctl_id: IoctlId,
        addresses: &[u8],
    ) -> Result<()> {
        let api = self.api()?;
        self.handles.check_channel(channel)?;
        if addresses.is_empty() {
            return Err(PassThruError::InvalidArgument(
                "functional lookup table update needs at least one address".into(),
            ));
        }
        let mut bytes = addresses.to_vec();
        let mut input = SByteArray::new(&mut bytes);
        let status = unsafe {
            api.ioctl(
                channel.raw(),
                ioctl_id.raw(),
                &mut input as *mut SByteArray as *mut c_void,
                ptr::null_mut(),
            )
        };
        self.check(&api, Operation::Ioctl, status)
    }

    /// Ioctl with no input and no output
    fn channel_ioctl(&mut self, channel: ChannelHandle, ioctl_id: IoctlId) -> Result<()> {
        let api = self.api()?;
        self.handles.check_channel(channel)?;
        let status =
            unsafe { api.ioctl(channel.raw(), ioctl_id.raw(), ptr::null_mut(), ptr::null_mut()) };
        self.check(&api, Operation::Ioctl, status)
    }

    /// Raw PassThruIoctl against a live handle.
    ///
    /// Handle tracking is not updated: use [`clear_msg_filters`](Self::clear_msg_filters)
    /// and [`clear_periodic_msgs`](Self::clear_periodic_msgs) rather than
    /// issuing those ids here.
    ///
    /// # Safety
    ///
    /// `input` and `output` must be null or point to live structures of the
    /// type the driver expects for `ioctl_id`.
    pub unsafe fn ioctl(
        &mut self,
        target: impl Into<IoctlTarget>,
        ioctl_id: IoctlId,
        input: *mut c_void,
        output: *mut c_void,
    ) -> Result<()> {
        let api = self.api()?;
        let handle = match target.into() {
            IoctlTarget::Device(device) => {
                self.handles.check_device(device)?;
                device.raw()
            }
            IoctlTarget::Channel(channel) => {
                self.handles.check_channel(channel)?;
                channel.raw()
            }
        };
        let status = api.ioctl(handle, ioctl_id.raw(), input, output);
        self.check(&api, Operation::Ioctl, status)
    }

    // -- Teardown --

    /// Release every live handle, newest first, then drop the driver.
    ///
    /// Failures are logged and do not stop the teardown. Calling this again,
    /// or using the session afterwards, is safe: operations return
    /// `DriverUnloaded`.
    pub fn unload(&mut self) {
        let Some(api) = self.driver.take() else {
            return;
        };
        let teardown = self.handles.teardown_order();
        for msg in &teardown.periodic {
            let status = api.stop_periodic_msg(msg.channel_raw(), msg.raw());
            warn_teardown(Operation::StopPeriodicMsg, status);
        }
        for filter in &teardown.filters {
            let status = api.stop_msg_filter(filter.channel_raw(), filter.raw());
            warn_teardown(Operation::StopMsgFilter, status);
        }
        for channel in &teardown.channels {
            let status = api.disconnect(channel.raw());
            warn_teardown(Operation::Disconnect, status);
        }
        for device in &teardown.devices {
            let status = api.close(device.raw());
            warn_teardown(Operation::Close, status);
        }
        self.handles.clear();
        log::info!("J2534 session unloaded");
    }
}

fn warn_teardown(operation: Operation, status: u32) {
    if let Err(e) = translate(operation, status, String::new) {
        log::warn!("Teardown: {}", e);
    }
}

impl<A: PassThruApi> Drop for PassThruSession<A> {
    fn drop(&mut self) {
        self.unload();
    }
}
