//! Root hub port bank.
//!
//! Ports own the [`AttachedUsbDevice`] mounted on them and the per-port
//! status dword the guest sees through HcRhPortStatus. Methods report
//! whether guest-visible state changed so the controller can raise RHSC;
//! state transitions that need controller context (remote wakeup, resume)
//! are decided by the controller itself.

use log::{trace, warn};

use crate::device::AttachedUsbDevice;
use crate::ohci::regs::*;
use crate::{UsbHubAttachError, UsbSpeed};
use io_snapshot::state::codec::{Decoder, Encoder};
use io_snapshot::state::SnapshotResult;

pub struct RootPort {
    /// HcRhPortStatus bits.
    pub(crate) ctrl: u32,
    pub(crate) device: Option<AttachedUsbDevice>,
}

impl RootPort {
    fn new() -> Self {
        Self {
            ctrl: 0,
            device: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.ctrl & PORT_PES != 0
    }
}

pub struct RootHub {
    ports: Vec<RootPort>,
}

impl RootHub {
    pub fn new(num_ports: usize) -> Self {
        Self {
            ports: (0..num_ports).map(|_| RootPort::new()).collect(),
        }
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    pub fn port(&self, index: usize) -> Option<&RootPort> {
        self.ports.get(index)
    }

    pub fn port_mut(&mut self, index: usize) -> Option<&mut RootPort> {
        self.ports.get_mut(index)
    }

    pub fn ports_mut(&mut self) -> impl Iterator<Item = &mut RootPort> {
        self.ports.iter_mut()
    }

    /// Register value the guest reads. Ports are always powered on this
    /// part (NoPowerSwitching), so PPS reads as set.
    pub fn read_port_status(&self, index: usize) -> u32 {
        match self.ports.get(index) {
            Some(p) => p.ctrl | PORT_PPS,
            None => 0,
        }
    }

    /// Mounts a device; sets connect status and change. Returns whether the
    /// visible port state changed (the caller raises RHSC).
    pub fn attach(
        &mut self,
        index: usize,
        device: AttachedUsbDevice,
    ) -> Result<bool, UsbHubAttachError> {
        let port = self
            .ports
            .get_mut(index)
            .ok_or(UsbHubAttachError::InvalidPort)?;
        if port.device.is_some() {
            return Err(UsbHubAttachError::PortOccupied);
        }
        let old = port.ctrl;
        port.ctrl |= PORT_CCS | PORT_CSC;
        match device.speed() {
            UsbSpeed::Low => port.ctrl |= PORT_LSDA,
            UsbSpeed::Full => port.ctrl &= !PORT_LSDA,
        }
        port.device = Some(device);
        trace!("ohci: attached device to root port {index}");
        Ok(old != port.ctrl)
    }

    /// Removes the device, leaving connect cleared with its change bit set.
    pub fn detach(
        &mut self,
        index: usize,
    ) -> Result<(AttachedUsbDevice, bool), UsbHubAttachError> {
        let port = self
            .ports
            .get_mut(index)
            .ok_or(UsbHubAttachError::InvalidPort)?;
        let mut device = port.device.take().ok_or(UsbHubAttachError::NoDevice)?;
        device.cancel_async();
        let old = port.ctrl;
        if port.ctrl & PORT_CCS != 0 {
            port.ctrl &= !PORT_CCS;
            port.ctrl |= PORT_CSC;
        }
        if port.ctrl & PORT_PES != 0 {
            port.ctrl &= !PORT_PES;
            port.ctrl |= PORT_PESC;
        }
        port.ctrl &= !PORT_LSDA;
        trace!("ohci: detached device from root port {index}");
        Ok((device, old != port.ctrl))
    }

    /// Finds the enabled downstream device answering to `address`.
    pub fn route(&mut self, address: u8) -> Option<&mut AttachedUsbDevice> {
        self.ports
            .iter_mut()
            .filter(|p| p.ctrl & PORT_PES != 0)
            .filter_map(|p| p.device.as_mut())
            .find_map(|d| d.device_mut_for_address(address))
    }

    fn set_port_feature_if_connected(port: &mut RootPort, bit: u32) -> bool {
        // Writing a feature bit to a disconnected port only latches CSC.
        if port.ctrl & PORT_CCS == 0 {
            port.ctrl |= PORT_CSC;
            return false;
        }
        if port.ctrl & bit != 0 {
            return false;
        }
        port.ctrl |= bit;
        true
    }

    fn set_port_power(port: &mut RootPort, on: bool) {
        if on {
            port.ctrl |= PORT_PPS;
        } else {
            port.ctrl &= !(PORT_PPS | PORT_CCS | PORT_PSS | PORT_PRS);
        }
    }

    pub fn power_all(&mut self, on: bool) {
        for port in &mut self.ports {
            Self::set_port_power(port, on);
        }
    }

    /// Guest write to HcRhPortStatus. Returns whether visible state changed.
    pub fn write_port_status(&mut self, index: usize, val: u32) -> bool {
        let Some(port) = self.ports.get_mut(index) else {
            warn!("ohci: write to nonexistent root port {index}");
            return false;
        };
        let old = port.ctrl;

        port.ctrl &= !(val & PORT_WTC);

        if val & PORT_CCS != 0 {
            // ClearPortEnable.
            port.ctrl &= !PORT_PES;
        }

        if val & PORT_PES != 0 {
            Self::set_port_feature_if_connected(port, PORT_PES);
        }

        if val & PORT_PSS != 0 && Self::set_port_feature_if_connected(port, PORT_PSS) {
            if let Some(dev) = port.device.as_mut() {
                dev.set_suspended(true);
            }
        }

        if val & PORT_PRS != 0 && Self::set_port_feature_if_connected(port, PORT_PRS) {
            // Reset signalling completes within the frame: deliver the bus
            // reset, then report completion with the port enabled.
            if let Some(dev) = port.device.as_mut() {
                dev.reset();
            }
            port.ctrl &= !PORT_PRS;
            port.ctrl |= PORT_PES | PORT_PRSC;
        }

        // Power last so an ambiguous write leaves the port powered.
        if val & PORT_LSDA != 0 {
            Self::set_port_power(port, false);
        }
        if val & PORT_PPS != 0 {
            Self::set_port_power(port, true);
        }

        old != port.ctrl
    }

    /// Clears suspend on ports whose device signalled remote wakeup.
    /// Returns whether any did (the caller handles RD/RHSC and bus resume).
    pub fn poll_remote_wakeup(&mut self) -> bool {
        let mut woke = false;
        for port in &mut self.ports {
            let suspended = port.ctrl & PORT_PSS != 0;
            if let Some(dev) = port.device.as_mut() {
                if suspended && dev.poll_remote_wakeup() {
                    port.ctrl &= !PORT_PSS;
                    port.ctrl |= PORT_PSSC;
                    dev.set_suspended(false);
                    woke = true;
                }
            }
        }
        woke
    }

    /// Controller reset: port state clears, connected devices re-announce.
    pub fn reset(&mut self) {
        for port in &mut self.ports {
            port.ctrl = 0;
            if let Some(dev) = port.device.as_mut() {
                dev.cancel_async();
                dev.reset();
                port.ctrl |= PORT_CCS | PORT_CSC;
                if dev.speed() == UsbSpeed::Low {
                    port.ctrl |= PORT_LSDA;
                }
            }
        }
    }

    pub fn save_ports(&self) -> Vec<u8> {
        let mut enc = Encoder::new().u32(self.ports.len() as u32);
        for port in &self.ports {
            enc = enc.u32(port.ctrl);
            match &port.device {
                Some(dev) => enc = enc.bool(true).vec_u8(&dev.save_state()),
                None => enc = enc.bool(false),
            }
        }
        enc.finish()
    }

    pub fn load_ports(bytes: &[u8]) -> SnapshotResult<Self> {
        let mut d = Decoder::new(bytes);
        let count = d.u32()? as usize;
        let mut ports = Vec::new();
        for _ in 0..count {
            let ctrl = d.u32()?;
            let device = if d.bool()? {
                let blob = d.vec_u8()?;
                Some(AttachedUsbDevice::restore(&blob)?)
            } else {
                None
            };
            ports.push(RootPort { ctrl, device });
        }
        d.finish()?;
        Ok(Self { ports })
    }
}
