use std::ffi::{c_char, c_void, CStr};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::j2534::error::{Operation, PassThruError, Result};
use crate::j2534::types::*;
use crate::j2534::PassThruApi;

/// Type aliases for J2534 DLL function pointers
type PassThruOpenFn = unsafe extern "system" fn(*const c_void, *mut u32) -> u32;
type PassThruCloseFn = unsafe extern "system" fn(u32) -> u32;
type PassThruConnectFn = unsafe extern "system" fn(u32, u32, u32, u32, *mut u32) -> u32;
type PassThruDisconnectFn = unsafe extern "system" fn(u32) -> u32;
type PassThruReadMsgsFn = unsafe extern "system" fn(u32, *mut PassThruMsg, *mut u32, u32) -> u32;
type PassThruWriteMsgsFn =
    unsafe extern "system" fn(u32, *const PassThruMsg, *mut u32, u32) -> u32;
type PassThruStartPeriodicMsgFn =
    unsafe extern "system" fn(u32, *const PassThruMsg, *mut u32, u32) -> u32;
type PassThruStopPeriodicMsgFn = unsafe extern "system" fn(u32, u32) -> u32;
type PassThruStartMsgFilterFn = unsafe extern "system" fn(
    u32,
    u32,
    *const PassThruMsg,
    *const PassThruMsg,
    *const PassThruMsg,
    *mut u32,
) -> u32;
type PassThruStopMsgFilterFn = unsafe extern "system" fn(u32, u32) -> u32;
type PassThruSetProgrammingVoltageFn = unsafe extern "system" fn(u32, u32, u32) -> u32;
type PassThruReadVersionFn =
    unsafe extern "system" fn(u32, *mut c_char, *mut c_char, *mut c_char) -> u32;
type PassThruGetLastErrorFn = unsafe extern "system" fn(*mut c_char) -> u32;
type PassThruIoctlFn = unsafe extern "system" fn(u32, u32, *mut c_void, *mut c_void) -> u32;

/// Holds a dynamically loaded J2534 DLL and its function pointers.
///
/// The pointers are only valid while `_lib` is loaded; they are private and
/// every call goes through [`PassThruApi`], so they cannot outlive it.
pub struct J2534Lib {
    path: PathBuf,
    pass_thru_open: PassThruOpenFn,
    pass_thru_close: PassThruCloseFn,
    pass_thru_connect: PassThruConnectFn,
    pass_thru_disconnect: PassThruDisconnectFn,
    pass_thru_read_msgs: PassThruReadMsgsFn,
    pass_thru_write_msgs: PassThruWriteMsgsFn,
    pass_thru_start_periodic_msg: PassThruStartPeriodicMsgFn,
    pass_thru_stop_periodic_msg: PassThruStopPeriodicMsgFn,
    pass_thru_start_msg_filter: PassThruStartMsgFilterFn,
    pass_thru_stop_msg_filter: PassThruStopMsgFilterFn,
    pass_thru_set_programming_voltage: PassThruSetProgrammingVoltageFn,
    pass_thru_read_version: PassThruReadVersionFn,
    pass_thru_get_last_error: PassThruGetLastErrorFn,
    pass_thru_ioctl: PassThruIoctlFn,
    _lib: libloading::Library,
}

/// Resolves one entry point by its exported name
unsafe fn resolve<T: Copy>(lib: &libloading::Library, operation: Operation) -> Result<T> {
    lib.get::<T>(operation.symbol().as_bytes())
        .map(|symbol| *symbol)
        .map_err(|_| PassThruError::EntryPointMissing(operation.symbol()))
}

impl J2534Lib {
    /// Load J2534 DLL from the given path.
    ///
    /// A module built for a different pointer width is rejected by the OS
    /// loader and surfaces as `DriverLoad`.
    pub fn load(dll_path: impl AsRef<Path>) -> Result<Self> {
        let path = dll_path.as_ref();
        unsafe {
            let lib = libloading::Library::new(path).map_err(|e| PassThruError::DriverLoad {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

            let driver = Self {
                path: path.to_path_buf(),
                pass_thru_open: resolve(&lib, Operation::Open)?,
                pass_thru_close: resolve(&lib, Operation::Close)?,
                pass_thru_connect: resolve(&lib, Operation::Connect)?,
                pass_thru_disconnect: resolve(&lib, Operation::Disconnect)?,
                pass_thru_read_msgs: resolve(&lib, Operation::ReadMsgs)?,
                pass_thru_write_msgs: resolve(&lib, Operation::WriteMsgs)?,
                pass_thru_start_periodic_msg: resolve(&lib, Operation::StartPeriodicMsg)?,
                pass_thru_stop_periodic_msg: resolve(&lib, Operation::StopPeriodicMsg)?,
                pass_thru_start_msg_filter: resolve(&lib, Operation::StartMsgFilter)?,
                pass_thru_stop_msg_filter: resolve(&lib, Operation::StopMsgFilter)?,
                pass_thru_set_programming_voltage: resolve(
                    &lib,
                    Operation::SetProgrammingVoltage,
                )?,
                pass_thru_read_version: resolve(&lib, Operation::ReadVersion)?,
                pass_thru_get_last_error: resolve(&lib, Operation::GetLastError)?,
                pass_thru_ioctl: resolve(&lib, Operation::Ioctl)?,
                _lib: lib,
            };
            log::info!("Loaded J2534 driver {}", path.display());
            Ok(driver)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for J2534Lib {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("J2534Lib").field("path", &self.path).finish()
    }
}

impl Drop for J2534Lib {
    fn drop(&mut self) {
        log::debug!("Unloading J2534 driver {}", self.path.display());
    }
}

impl PassThruApi for J2534Lib {
    fn open(&self, name: Option<&CStr>, device_id: &mut u32) -> u32 {
        let name = name.map_or(std::ptr::null(), |n| n.as_ptr() as *const c_void);
        unsafe { (self.pass_thru_open)(name, device_id) }
    }

    fn close(&self, device_id: u32) -> u32 {
        unsafe { (self.pass_thru_close)(device_id) }
    }

    fn connect(
        &self,
        device_id: u32,
        protocol_id: u32,
        flags: u32,
        baud_rate: u32,
        channel_id: &mut u32,
    ) -> u32 {
        unsafe { (self.pass_thru_connect)(device_id, protocol_id, flags, baud_rate, channel_id) }
    }

    fn disconnect(&self, channel_id: u32) -> u32 {
        unsafe { (self.pass_thru_disconnect)(channel_id) }
    }

    fn read_msgs(
        &self,
        channel_id: u32,
        msgs: &mut [PassThruMsg],
        num_msgs: &mut u32,
        timeout_ms: u32,
    ) -> u32 {
        // The driver trusts the count; never let it exceed the buffer
        *num_msgs = (*num_msgs).min(msgs.len() as u32);
        unsafe { (self.pass_thru_read_msgs)(channel_id, msgs.as_mut_ptr(), num_msgs, timeout_ms) }
    }

    fn write_msgs(
        &self,
        channel_id: u32,
        msgs: &[PassThruMsg],
        num_msgs: &mut u32,
        timeout_ms: u32,
    ) -> u32 {
        *num_msgs = (*num_msgs).min(msgs.len() as u32);
        unsafe { (self.pass_thru_write_msgs)(channel_id, msgs.as_ptr(), num_msgs, timeout_ms) }
    }

    fn start_periodic_msg(
        &self,
        channel_id: u32,
        msg: &PassThruMsg,
        msg_id: &mut u32,
        interval_ms: u32,
    ) -> u32 {
        unsafe { (self.pass_thru_start_periodic_msg)(channel_id, msg, msg_id, interval_ms) }
    }

    fn stop_periodic_msg(&self, channel_id: u32, msg_id: u32) -> u32 {
        unsafe { (self.pass_thru_stop_periodic_msg)(channel_id, msg_id) }
    }

    fn start_msg_filter(
        &self,
        channel_id: u32,
        filter_type: u32,
        mask: &PassThruMsg,
        pattern: &PassThruMsg,
        flow_control: Option<&PassThruMsg>,
        filter_id: &mut u32,
    ) -> u32 {
        let flow_control = flow_control.map_or(std::ptr::null(), |m| m as *const PassThruMsg);
        unsafe {
            (self.pass_thru_start_msg_filter)(
                channel_id,
                filter_type,
                mask,
                pattern,
                flow_control,
                filter_id,
            )
        }
    }

    fn stop_msg_filter(&self, channel_id: u32, filter_id: u32) -> u32 {
        unsafe { (self.pass_thru_stop_msg_filter)(channel_id, filter_id) }
    }

    fn set_programming_voltage(&self, device_id: u32, pin: u32, voltage: u32) -> u32 {
        unsafe { (self.pass_thru_set_programming_voltage)(device_id, pin, voltage) }
    }

    fn read_version(
        &self,
        device_id: u32,
        firmware: &mut [u8; PASSTHRU_TEXT_SIZE],
        dll: &mut [u8; PASSTHRU_TEXT_SIZE],
        api: &mut [u8; PASSTHRU_TEXT_SIZE],
    ) -> u32 {
        unsafe {
            (self.pass_thru_read_version)(
                device_id,
                firmware.as_mut_ptr() as *mut c_char,
                dll.as_mut_ptr() as *mut c_char,
                api.as_mut_ptr() as *mut c_char,
            )
        }
    }

    fn get_last_error(&self, description: &mut [u8; PASSTHRU_TEXT_SIZE]) -> u32 {
        unsafe { (self.pass_thru_get_last_error)(description.as_mut_ptr() as *mut c_char) }
    }

    unsafe fn ioctl(
        &self,
        handle_id: u32,
        ioctl_id: u32,
        input: *mut c_void,
        output: *mut c_void,
    ) -> u32 {
        (self.pass_thru_ioctl)(handle_id, ioctl_id, input, output)
    }
}
