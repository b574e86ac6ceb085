//! Save and restore for the concrete device personalities.
//!
//! Snapshot blobs identify a model by a stable kind byte so a restored
//! device tree can be rebuilt without help from the caller. Models this
//! crate does not know about save as kind 0 and come back as an error,
//! which makes the whole restore fail closed.

use log::warn;

use crate::hid::{UsbHidKeyboard, UsbHidMouse};
use crate::hub::UsbHubDevice;
use crate::storage::UsbMassStorage;
use crate::UsbDeviceModel;
use io_snapshot::state::{IoSnapshot, SnapshotError, SnapshotResult};

/// Wire identifier for each personality. Values are part of the snapshot
/// format and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceKind {
    ExternalHub = 1,
    HidMouse = 2,
    HidKeyboard = 3,
    MassStorage = 4,
}

/// Identifies and serializes a model, or `None` for foreign models.
pub fn save_model(model: &dyn UsbDeviceModel) -> Option<(DeviceKind, Vec<u8>)> {
    let any = model.as_any();
    if let Some(hub) = any.downcast_ref::<UsbHubDevice>() {
        return Some((DeviceKind::ExternalHub, hub.save_state()));
    }
    if let Some(mouse) = any.downcast_ref::<UsbHidMouse>() {
        return Some((DeviceKind::HidMouse, mouse.save_state()));
    }
    if let Some(kbd) = any.downcast_ref::<UsbHidKeyboard>() {
        return Some((DeviceKind::HidKeyboard, kbd.save_state()));
    }
    if let Some(disk) = any.downcast_ref::<UsbMassStorage>() {
        return Some((DeviceKind::MassStorage, disk.save_state()));
    }
    warn!("usb: cannot snapshot unknown device model");
    None
}

/// Rebuilds a model from its kind byte and snapshot blob.
pub fn restore_model(kind: u8, blob: &[u8]) -> SnapshotResult<Box<dyn UsbDeviceModel>> {
    match kind {
        k if k == DeviceKind::ExternalHub as u8 => {
            let mut hub = UsbHubDevice::new(0);
            hub.load_state(blob)?;
            Ok(Box::new(hub))
        }
        k if k == DeviceKind::HidMouse as u8 => {
            let mut mouse = UsbHidMouse::new();
            mouse.load_state(blob)?;
            Ok(Box::new(mouse))
        }
        k if k == DeviceKind::HidKeyboard as u8 => {
            let mut kbd = UsbHidKeyboard::new();
            kbd.load_state(blob)?;
            Ok(Box::new(kbd))
        }
        k if k == DeviceKind::MassStorage as u8 => {
            let mut disk = UsbMassStorage::new(Vec::new());
            disk.load_state(blob)?;
            Ok(Box::new(disk))
        }
        _ => Err(SnapshotError::InvalidFieldEncoding("unknown device model")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mouse_round_trips_through_kind_byte() {
        let mouse = UsbHidMouse::new();
        let (kind, blob) = save_model(&mouse).unwrap();
        assert_eq!(kind, DeviceKind::HidMouse);
        let restored = restore_model(kind as u8, &blob).unwrap();
        assert!(restored.as_any().downcast_ref::<UsbHidMouse>().is_some());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert_eq!(
            restore_model(0, &[]).err(),
            Some(SnapshotError::InvalidFieldEncoding("unknown device model"))
        );
        assert!(restore_model(0x7f, &[]).is_err());
    }
}
