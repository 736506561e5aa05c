use crate::device::DeviceHandle;
use heapless::Vec;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MAX_DEVICES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("daisy chain is full ({MAX_DEVICES} devices)")]
    Full,
    #[error("no device registered as 0x{0:02X}")]
    UnknownDevice(u8),
    #[error("device id 0x{0:02X} already in use")]
    IdInUse(u8),
}

/// Ordered registry of the devices sharing the bus.
///
/// Holds handles only; the application owns the devices. The id of each
/// entry is whatever the device itself reports, so a device that renames
/// itself is found under its new id without being re-registered. The
/// engine calls [`DaisyChain::resolve_id_clash`] when that happens.
#[derive(Default)]
pub struct DaisyChain {
    devices: Vec<DeviceHandle, MAX_DEVICES>,
}

impl DaisyChain {
    pub fn new() -> Self {
        Self { devices: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Register `device` as `id`. A device already holding `id` is replaced
    /// in place, keeping its position. Registering a handle that is already
    /// in the chain only re-keys it.
    pub fn add(&mut self, device: DeviceHandle, id: u8) -> Result<(), ChainError> {
        if let Some(pos) = self.position_of_handle(&device) {
            device.borrow_mut().set_id(id);
            self.drop_duplicates_of(pos);
            return Ok(());
        }

        if let Some(pos) = self.position_of_id(id) {
            info!("Replacing device 0x{:02X}", id);
            device.borrow_mut().set_id(id);
            self.devices[pos] = device;
            return Ok(());
        }

        // A rejected device keeps its old id
        self.devices.push(Rc::clone(&device)).map_err(|_| ChainError::Full)?;
        device.borrow_mut().set_id(id);
        debug!("Added device 0x{:02X} ({} on chain)", id, self.devices.len());
        Ok(())
    }

    pub fn remove(&mut self, id: u8) -> Result<DeviceHandle, ChainError> {
        let pos = self.position_of_id(id).ok_or(ChainError::UnknownDevice(id))?;
        debug!("Removed device 0x{:02X}", id);
        Ok(self.devices.remove(pos))
    }

    pub fn remove_handle(&mut self, device: &DeviceHandle) -> bool {
        match self.position_of_handle(device) {
            Some(pos) => {
                self.devices.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: u8) -> Option<DeviceHandle> {
        self.position_of_id(id).map(|pos| Rc::clone(&self.devices[pos]))
    }

    pub fn contains(&self, device: &DeviceHandle) -> bool {
        self.position_of_handle(device).is_some()
    }

    pub fn change_id(&mut self, from: u8, to: u8) -> Result<(), ChainError> {
        if from == to {
            return self.position_of_id(from).map(|_| ()).ok_or(ChainError::UnknownDevice(from));
        }
        if self.position_of_id(to).is_some() {
            return Err(ChainError::IdInUse(to));
        }

        let pos = self.position_of_id(from).ok_or(ChainError::UnknownDevice(from))?;
        self.devices[pos].borrow_mut().set_id(to);
        info!("Device 0x{:02X} is now 0x{:02X}", from, to);
        Ok(())
    }

    pub fn swap_ids(&mut self, a: u8, b: u8) -> Result<(), ChainError> {
        let pa = self.position_of_id(a).ok_or(ChainError::UnknownDevice(a))?;
        let pb = self.position_of_id(b).ok_or(ChainError::UnknownDevice(b))?;
        if pa == pb {
            return Ok(());
        }

        self.devices[pa].borrow_mut().set_id(b);
        self.devices[pb].borrow_mut().set_id(a);
        info!("Swapped devices 0x{:02X} and 0x{:02X}", a, b);
        Ok(())
    }

    /// Disk swap: the device answering `ids[i]` moves to `ids[i + 1]`, the
    /// last one wraps to `ids[0]`. Ids with no device are skipped.
    pub fn rotate_ids(&mut self, ids: &[u8]) -> usize {
        let present: std::vec::Vec<(usize, u8)> = ids
            .iter()
            .filter_map(|&id| self.position_of_id(id).map(|pos| (pos, id)))
            .collect();

        if present.len() < 2 {
            return 0;
        }

        for (n, &(pos, _)) in present.iter().enumerate() {
            let next_id = present[(n + 1) % present.len()].1;
            self.devices[pos].borrow_mut().set_id(next_id);
        }

        info!("Rotated {} device ids", present.len());
        present.len()
    }

    /// Devices in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceHandle> {
        self.devices.iter()
    }

    /// Active broadcast listeners, in registration order.
    pub fn broadcast_listeners(&self) -> std::vec::Vec<DeviceHandle> {
        self.devices
            .iter()
            .filter(|d| {
                d.try_borrow()
                    .map(|d| d.listens_to_broadcast() && d.is_active())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> std::vec::Vec<u8> {
        self.devices
            .iter()
            .filter_map(|d| d.try_borrow().ok().map(|d| d.id()))
            .collect()
    }

    /// Keep at most one device per id after `device` changed its own id:
    /// whoever already answered the new id is dropped, as if `device` had
    /// been registered under it. Returns the dropped handles.
    pub fn resolve_id_clash(&mut self, device: &DeviceHandle) -> std::vec::Vec<DeviceHandle> {
        match self.position_of_handle(device) {
            Some(pos) => self.drop_duplicates_of(pos),
            None => std::vec::Vec::new(),
        }
    }

    fn drop_duplicates_of(&mut self, pos: usize) -> std::vec::Vec<DeviceHandle> {
        let keep = Rc::clone(&self.devices[pos]);
        let mut dropped = std::vec::Vec::new();
        let Ok(id) = keep.try_borrow().map(|d| d.id()) else {
            return dropped;
        };

        while let Some(other) = self
            .position_of_handle(&keep)
            .and_then(|p| self.position_of_id_except(id, p))
        {
            warn!("Dropping device previously registered as 0x{:02X}", id);
            dropped.push(self.devices.remove(other));
        }
        dropped
    }

    fn position_of_id(&self, id: u8) -> Option<usize> {
        self.devices
            .iter()
            .position(|d| d.try_borrow().map(|d| d.id() == id).unwrap_or(false))
    }

    fn position_of_id_except(&self, id: u8, skip: usize) -> Option<usize> {
        self.devices.iter().enumerate().position(|(i, d)| {
            i != skip && d.try_borrow().map(|d| d.id() == id).unwrap_or(false)
        })
    }

    fn position_of_handle(&self, device: &DeviceHandle) -> Option<usize> {
        let target = Rc::as_ptr(device) as *const ();
        self.devices
            .iter()
            .position(|d| std::ptr::eq(Rc::as_ptr(d) as *const (), target))
    }
}
