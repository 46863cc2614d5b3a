use std::collections::{BTreeMap, BTreeSet};

use crate::j2534::error::{HandleRef, PassThruError, Result};
use crate::j2534::types::ProtocolId;

/// Device returned by PassThruOpen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    raw: u32,
    serial: u64,
}

/// Channel returned by PassThruConnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    raw: u32,
    serial: u64,
}

/// Filter returned by PassThruStartMsgFilter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterHandle {
    channel: u32,
    raw: u32,
    serial: u64,
}

/// Periodic message returned by PassThruStartPeriodicMsg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeriodicMsgHandle {
    channel: u32,
    raw: u32,
    serial: u64,
}

impl DeviceHandle {
    /// Id the driver issued
    pub fn raw(&self) -> u32 {
        self.raw
    }
}

impl ChannelHandle {
    pub fn raw(&self) -> u32 {
        self.raw
    }
}

impl FilterHandle {
    pub fn raw(&self) -> u32 {
        self.raw
    }

    pub fn channel_raw(&self) -> u32 {
        self.channel
    }
}

impl PeriodicMsgHandle {
    pub fn raw(&self) -> u32 {
        self.raw
    }

    pub fn channel_raw(&self) -> u32 {
        self.channel
    }
}

impl From<DeviceHandle> for HandleRef {
    fn from(h: DeviceHandle) -> Self {
        HandleRef::Device(h.raw)
    }
}

impl From<ChannelHandle> for HandleRef {
    fn from(h: ChannelHandle) -> Self {
        HandleRef::Channel(h.raw)
    }
}

impl From<FilterHandle> for HandleRef {
    fn from(h: FilterHandle) -> Self {
        HandleRef::Filter {
            channel: h.channel,
            filter: h.raw,
        }
    }
}

impl From<PeriodicMsgHandle> for HandleRef {
    fn from(h: PeriodicMsgHandle) -> Self {
        HandleRef::PeriodicMsg {
            channel: h.channel,
            msg: h.raw,
        }
    }
}

#[derive(Debug)]
struct DeviceNode {
    serial: u64,
    channels: BTreeSet<u32>,
}

#[derive(Debug)]
struct ChannelNode {
    serial: u64,
    device: u32,
    protocol: ProtocolId,
    filters: BTreeMap<u32, u64>,
    periodic: BTreeMap<u32, u64>,
}

/// Handles still live in a session, in the order they must be released
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Teardown {
    pub periodic: Vec<PeriodicMsgHandle>,
    pub filters: Vec<FilterHandle>,
    pub channels: Vec<ChannelHandle>,
    pub devices: Vec<DeviceHandle>,
}

/// Ownership tree device → channels → filters / periodic messages.
///
/// The driver never reports cascading invalidation, so this is the only
/// record of which handles are live. Every handle carries a serial number;
/// a raw id the driver reuses later gets a new serial and old copies stay
/// stale.
#[derive(Debug, Default)]
pub(crate) struct HandleTree {
    next_serial: u64,
    devices: BTreeMap<u32, DeviceNode>,
    channels: BTreeMap<u32, ChannelNode>,
}

impl HandleTree {
    fn issue_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn insert_device(&mut self, raw: u32) -> DeviceHandle {
        if self.devices.contains_key(&raw) {
            log::warn!("driver reissued live device id {}; dropping the old handle", raw);
            self.drop_device(raw);
        }
        let serial = self.issue_serial();
        self.devices.insert(
            raw,
            DeviceNode {
                serial,
                channels: BTreeSet::new(),
            },
        );
        DeviceHandle { raw, serial }
    }

    pub fn check_device(&self, device: DeviceHandle) -> Result<()> {
        match self.devices.get(&device.raw) {
            Some(node) if node.serial == device.serial => Ok(()),
            _ => Err(PassThruError::StaleHandle(device.into())),
        }
    }

    /// Forgets the device and everything opened beneath it
    pub fn remove_device(&mut self, device: DeviceHandle) {
        if self.check_device(device).is_ok() {
            self.drop_device(device.raw);
        }
    }

    fn drop_device(&mut self, raw: u32) {
        if let Some(node) = self.devices.remove(&raw) {
            for channel in node.channels {
                self.channels.remove(&channel);
            }
        }
    }

    pub fn insert_channel(
        &mut self,
        device: DeviceHandle,
        raw: u32,
        protocol: ProtocolId,
    ) -> Result<ChannelHandle> {
        self.check_device(device)?;
        if self.channels.contains_key(&raw) {
            log::warn!("driver reissued live channel id {}; dropping the old handle", raw);
            self.drop_channel(raw);
        }
        let serial = self.issue_serial();
        self.channels.insert(
            raw,
            ChannelNode {
                serial,
                device: device.raw,
                protocol,
                filters: BTreeMap::new(),
                periodic: BTreeMap::new(),
            },
        );
        if let Some(node) = self.devices.get_mut(&device.raw) {
            node.channels.insert(raw);
        }
        Ok(ChannelHandle { raw, serial })
    }

    fn channel_node(&self, channel: ChannelHandle) -> Result<&ChannelNode> {
        match self.channels.get(&channel.raw) {
            Some(node) if node.serial == channel.serial => Ok(node),
            _ => Err(PassThruError::StaleHandle(channel.into())),
        }
    }

    fn channel_node_mut(&mut self, channel: ChannelHandle) -> Result<&mut ChannelNode> {
        match self.channels.get_mut(&channel.raw) {
            Some(node) if node.serial == channel.serial => Ok(node),
            _ => Err(PassThruError::StaleHandle(channel.into())),
        }
    }

    pub fn check_channel(&self, channel: ChannelHandle) -> Result<()> {
        self.channel_node(channel).map(|_| ())
    }

    /// Protocol the channel was connected with
    pub fn channel_protocol(&self, channel: ChannelHandle) -> Result<ProtocolId> {
        self.channel_node(channel).map(|node| node.protocol)
    }

    pub fn remove_channel(&mut self, channel: ChannelHandle) {
        if self.check_channel(channel).is_ok() {
            self.drop_channel(channel.raw);
        }
    }

    fn drop_channel(&mut self, raw: u32) {
        if let Some(node) = self.channels.remove(&raw) {
            if let Some(device) = self.devices.get_mut(&node.device) {
                device.channels.remove(&raw);
            }
        }
    }

    pub fn insert_filter(&mut self, channel: ChannelHandle, raw: u32) -> Result<FilterHandle> {
        let serial = self.issue_serial();
        self.channel_node_mut(channel)?.filters.insert(raw, serial);
        Ok(FilterHandle {
            channel: channel.raw,
            raw,
            serial,
        })
    }

    pub fn check_filter(&self, filter: FilterHandle) -> Result<()> {
        match self.channels.get(&filter.channel) {
            Some(node) if node.filters.get(&filter.raw) == Some(&filter.serial) => Ok(()),
            _ => Err(PassThruError::StaleHandle(filter.into())),
        }
    }

    pub fn remove_filter(&mut self, filter: FilterHandle) {
        if self.check_filter(filter).is_ok() {
            if let Some(node) = self.channels.get_mut(&filter.channel) {
                node.filters.remove(&filter.raw);
            }
        }
    }

    pub fn clear_filters(&mut self, channel: ChannelHandle) -> Result<()> {
        self.channel_node_mut(channel)?.filters.clear();
        Ok(())
    }

    pub fn insert_periodic(
        &mut self,
        channel: ChannelHandle,
        raw: u32,
    ) -> Result<PeriodicMsgHandle> {
        let serial = self.issue_serial();
        self.channel_node_mut(channel)?.periodic.insert(raw, serial);
        Ok(PeriodicMsgHandle {
            channel: channel.raw,
            raw,
            serial,
        })
    }

    pub fn check_periodic(&self, msg: PeriodicMsgHandle) -> Result<()> {
        match self.channels.get(&msg.channel) {
            Some(node) if node.periodic.get(&msg.raw) == Some(&msg.serial) => Ok(()),
            _ => Err(PassThruError::StaleHandle(msg.into())),
        }
    }

    pub fn remove_periodic(&mut self, msg: PeriodicMsgHandle) {
        if self.check_periodic(msg).is_ok() {
            if let Some(node) = self.channels.get_mut(&msg.channel) {
                node.periodic.remove(&msg.raw);
            }
        }
    }

    pub fn clear_periodic(&mut self, channel: ChannelHandle) -> Result<()> {
        self.channel_node_mut(channel)?.periodic.clear();
        Ok(())
    }

    /// Snapshot of everything live, newest first within each level
    pub fn teardown_order(&self) -> Teardown {
        let mut teardown = Teardown::default();
        for (&channel, node) in self.channels.iter().rev() {
            for (&raw, &serial) in node.periodic.iter().rev() {
                teardown.periodic.push(PeriodicMsgHandle {
                    channel,
                    raw,
                    serial,
                });
            }
            for (&raw, &serial) in node.filters.iter().rev() {
                teardown.filters.push(FilterHandle {
                    channel,
                    raw,
                    serial,
                });
            }
            teardown.channels.push(ChannelHandle {
                raw: channel,
                serial: node.serial,
            });
        }
        for (&raw, node) in self.devices.iter().rev() {
            teardown.devices.push(DeviceHandle {
                raw,
                serial: node.serial,
            });
        }
        teardown
    }

    pub fn clear(&mut self) {
        self.devices.clear();
        self.channels.clear();
    }
}
