pub mod discover;
pub mod dll;
pub mod error;
pub mod handles;
pub mod ioctl;
pub mod message;
#[cfg(test)]
pub mod mock;
pub mod session;
pub mod types;

use std::ffi::{c_void, CStr};

use types::{PassThruMsg, PASSTHRU_TEXT_SIZE};

/// The fourteen J2534 v04.04 entry points, one method each.
///
/// Every method returns the driver's raw status code; interpreting it is the
/// job of [`error::translate`]. Implemented by [`dll::J2534Lib`] for real
/// driver modules, and by a recording mock in tests.
pub trait PassThruApi {
    fn open(&self, name: Option<&CStr>, device_id: &mut u32) -> u32;

    fn close(&self, device_id: u32) -> u32;

    fn connect(
        &self,
        device_id: u32,
        protocol_id: u32,
        flags: u32,
        baud_rate: u32,
        channel_id: &mut u32,
    ) -> u32;

    fn disconnect(&self, channel_id: u32) -> u32;

    /// `num_msgs` holds the requested count on entry and the count read on return
    fn read_msgs(
        &self,
        channel_id: u32,
        msgs: &mut [PassThruMsg],
        num_msgs: &mut u32,
        timeout_ms: u32,
    ) -> u32;

    /// `num_msgs` holds the requested count on entry and the count sent on return
    fn write_msgs(
        &self,
        channel_id: u32,
        msgs: &[PassThruMsg],
        num_msgs: &mut u32,
        timeout_ms: u32,
    ) -> u32;

    fn start_periodic_msg(
        &self,
        channel_id: u32,
        msg: &PassThruMsg,
        msg_id: &mut u32,
        interval_ms: u32,
    ) -> u32;

    fn stop_periodic_msg(&self, channel_id: u32, msg_id: u32) -> u32;

    fn start_msg_filter(
        &self,
        channel_id: u32,
        filter_type: u32,
        mask: &PassThruMsg,
        pattern: &PassThruMsg,
        flow_control: Option<&PassThruMsg>,
        filter_id: &mut u32,
    ) -> u32;

    fn stop_msg_filter(&self, channel_id: u32, filter_id: u32) -> u32;

    fn set_programming_voltage(&self, device_id: u32, pin: u32, voltage: u32) -> u32;

    fn read_version(
        &self,
        device_id: u32,
        firmware: &mut [u8; PASSTHRU_TEXT_SIZE],
        dll: &mut [u8; PASSTHRU_TEXT_SIZE],
        api: &mut [u8; PASSTHRU_TEXT_SIZE],
    ) -> u32;

    fn get_last_error(&self, description: &mut [u8; PASSTHRU_TEXT_SIZE]) -> u32;

    /// # Safety
    ///
    /// `input` and `output` must be null or point to live structures of the
    /// type `ioctl_id` expects (SCONFIG_LIST, SBYTE_ARRAY, PASSTHRU_MSG or
    /// u32), valid for the duration of the call.
    unsafe fn ioctl(
        &self,
        handle_id: u32,
        ioctl_id: u32,
        input: *mut c_void,
        output: *mut c_void,
    ) -> u32;
}
