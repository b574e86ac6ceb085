//! Host-side plugin surface: lifecycle, MMIO access width handling, clock
//! advance with interrupt delivery, and whole-subsystem save states.
//!
//! The embedding machine owns guest memory and the interrupt line; both are
//! passed in at the call sites that need them.

use log::{info, warn};
use thiserror::Error;

use crate::device::AttachedUsbDevice;
use crate::memory::MemoryBus;
use crate::ohci::OhciController;
use crate::{UsbDeviceModel, UsbHubAttachError};
use io_snapshot::state::{IoSnapshot, SnapshotError};

/// Signals the guest interrupt line on behalf of the controller.
pub trait IrqLine {
    fn raise(&mut self);
}

impl<F: FnMut()> IrqLine for F {
    fn raise(&mut self) {
        self()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UsbPluginConfig {
    pub num_ports: usize,
    /// Physical base the guest programs into list pointers; subtracted
    /// before DMA.
    pub localmem_base: u32,
    /// Rate of the clock feeding [`UsbPlugin::advance`].
    pub ticks_per_sec: u64,
}

impl Default for UsbPluginConfig {
    fn default() -> Self {
        Self {
            num_ports: 2,
            localmem_base: 0,
            ticks_per_sec: crate::ohci::USB_HZ,
        }
    }
}

/// Why a saved state was rejected. The plugin keeps its current state when
/// loading fails.
#[derive(Debug, Error)]
pub enum StateLoadError {
    #[error("save state signature mismatch")]
    BadSignature,
    #[error("corrupt save state: {0}")]
    Corrupt(#[from] SnapshotError),
}

const STATE_SIGNATURE: [u8; 8] = *b"USBOHCI\0";

pub struct UsbPlugin {
    controller: OhciController,
    open: bool,
}

impl UsbPlugin {
    pub fn new(config: UsbPluginConfig) -> Self {
        Self {
            controller: OhciController::new(
                config.num_ports,
                config.localmem_base,
                config.ticks_per_sec,
            ),
            open: false,
        }
    }

    /// Emulation session starts. Idempotent.
    pub fn open(&mut self) {
        if !self.open {
            info!("usb: plugin opened");
            self.open = true;
        }
    }

    pub fn close(&mut self) {
        if self.open {
            info!("usb: plugin closed");
            self.open = false;
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn controller(&self) -> &OhciController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut OhciController {
        &mut self.controller
    }

    /// Mounts a device model on a root hub port.
    pub fn attach_device(
        &mut self,
        port: usize,
        model: Box<dyn UsbDeviceModel>,
    ) -> Result<(), UsbHubAttachError> {
        self.controller
            .attach_device(port, AttachedUsbDevice::new(model))
    }

    pub fn detach_device(&mut self, port: usize) -> Result<AttachedUsbDevice, UsbHubAttachError> {
        self.controller.detach_device(port)
    }

    // The register file is dword-only. Narrow reads float high, narrow
    // writes are dropped.

    pub fn read8(&self, addr: u32) -> u8 {
        warn!("usb: 8-bit read at {addr:#x}");
        0xff
    }

    pub fn read16(&self, addr: u32) -> u16 {
        warn!("usb: 16-bit read at {addr:#x}");
        0xffff
    }

    pub fn read32(&self, addr: u32) -> u32 {
        self.controller.mmio_read(addr)
    }

    pub fn write8(&mut self, addr: u32, val: u8) {
        warn!("usb: 8-bit write of {val:#x} at {addr:#x} dropped");
    }

    pub fn write16(&mut self, addr: u32, val: u16) {
        warn!("usb: 16-bit write of {val:#x} at {addr:#x} dropped");
    }

    pub fn write32(&mut self, addr: u32, val: u32) {
        self.controller.mmio_write(addr, val);
    }

    /// Advances emulated time, raising `irq` once per interrupt line edge.
    pub fn advance<M: MemoryBus + ?Sized, I: IrqLine + ?Sized>(
        &mut self,
        mem: &mut M,
        ticks: u64,
        irq: &mut I,
    ) {
        self.controller.advance_cycles(mem, ticks);
        if self.controller.take_irq_edge() {
            irq.raise();
        }
    }

    pub fn save_state(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&STATE_SIGNATURE);
        out.extend_from_slice(&self.controller.save_state());
        out
    }

    /// Replaces the whole subsystem state. On error the previous state is
    /// kept.
    pub fn load_state(&mut self, bytes: &[u8]) -> Result<(), StateLoadError> {
        let body = bytes
            .strip_prefix(&STATE_SIGNATURE[..])
            .ok_or(StateLoadError::BadSignature)?;
        self.controller.load_state(body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::UsbHidMouse;
    use crate::memory::MemoryAccessError;
    use crate::ohci::regs::*;

    struct NoMemory;

    impl MemoryBus for NoMemory {
        fn read_physical(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryAccessError> {
            Err(MemoryAccessError {
                addr,
                len: buf.len(),
            })
        }
        fn write_physical(&mut self, addr: u32, buf: &[u8]) -> Result<(), MemoryAccessError> {
            Err(MemoryAccessError {
                addr,
                len: buf.len(),
            })
        }
    }

    #[test]
    fn narrow_accesses_are_inert() {
        let mut plugin = UsbPlugin::new(UsbPluginConfig::default());
        assert_eq!(plugin.read8(REG_CONTROL), 0xff);
        assert_eq!(plugin.read16(REG_CONTROL), 0xffff);
        plugin.write8(REG_HCCA, 0x12);
        plugin.write16(REG_HCCA, 0x1234);
        assert_eq!(plugin.read32(REG_HCCA), 0);
    }

    #[test]
    fn revision_register_reads_wide() {
        let plugin = UsbPlugin::new(UsbPluginConfig::default());
        assert_eq!(plugin.read32(REG_REVISION), HC_REVISION);
    }

    #[test]
    fn attach_raises_irq_through_line() {
        let mut plugin = UsbPlugin::new(UsbPluginConfig::default());
        plugin.open();
        plugin.write32(REG_INTR_ENABLE, INTR_MIE | INTR_RHSC);
        plugin
            .attach_device(0, Box::new(UsbHidMouse::new()))
            .unwrap();
        let mut raised = false;
        plugin.advance(&mut NoMemory, 1, &mut || raised = true);
        assert!(raised);
    }

    #[test]
    fn state_round_trip_and_bad_signature() {
        let mut plugin = UsbPlugin::new(UsbPluginConfig::default());
        plugin
            .attach_device(1, Box::new(UsbHidMouse::new()))
            .unwrap();
        plugin.write32(REG_HCCA, 0x1234_5600);
        let state = plugin.save_state();

        let mut other = UsbPlugin::new(UsbPluginConfig::default());
        other.load_state(&state).unwrap();
        assert_eq!(other.read32(REG_HCCA), 0x1234_5600);
        assert!(other.controller().hub().port(1).unwrap().device.is_some());

        // A foreign blob is rejected without touching current state.
        other.write32(REG_HCCA, 0);
        assert!(matches!(
            other.load_state(b"NOTAUSB\0junk"),
            Err(StateLoadError::BadSignature)
        ));
        let mut truncated = state.clone();
        truncated.truncate(12);
        assert!(other.load_state(&truncated).is_err());
        assert_eq!(other.read32(REG_HCCA), 0);
    }
}
