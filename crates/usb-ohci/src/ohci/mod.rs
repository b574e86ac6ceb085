//! OHCI host controller: operational registers, frame engine and interrupt
//! logic. Schedule walking lives in [`schedule`], guest structures in
//! [`descriptor`], the port bank in [`hub`].
//!
//! The controller is driven externally: the machine clocks it through
//! [`OhciController::advance_cycles`] and each elapsed 1 ms frame interval
//! runs one frame boundary (periodic lists, control/bulk lists, done queue,
//! SOF). MMIO is dword-only; misaligned accesses read all-ones and drop
//! writes, as on the real part.

pub mod descriptor;
pub mod hub;
pub mod regs;
mod schedule;

pub use hub::RootHub;
use schedule::AsyncSlot;

use log::{error, warn};

use crate::device::AttachedUsbDevice;
use crate::memory::MemoryBus;
use crate::UsbHubAttachError;
use io_snapshot::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use regs::*;

/// Nominal USB wire clock, 12 MHz.
pub const USB_HZ: u64 = 12_000_000;

/// Minimum spacing, in controller clock ticks, between two interrupt line
/// assertions. The line is edge-signalled to the host; a guest acknowledging
/// and immediately re-raising within this window is debounced.
pub const MIN_IRQ_INTERVAL_TICKS: u64 = 64;

pub struct OhciController {
    // Operational registers.
    ctl: u32,
    old_ctl: u32,
    status: u32,
    intr_status: u32,
    intr: u32,
    hcca: u32,
    ctrl_head: u32,
    ctrl_cur: u32,
    bulk_head: u32,
    bulk_cur: u32,
    per_cur: u32,
    done: u32,
    fsmps: u32,
    fit: bool,
    fi: u32,
    frt: bool,
    frame_number: u16,
    pstart: u32,
    lst: u32,
    rhdesc_a: u32,
    rhdesc_b: u32,
    rhstatus: u32,

    // Vendor extension block.
    hstatus: u32,
    hmask: u32,
    hreset: u32,
    htest: u32,

    // Scheduling state.
    done_count: u32,
    async_slot: AsyncSlot,
    hub: RootHub,

    // Clocking.
    localmem_base: u32,
    frame_ticks: u64,
    bit_ticks: u64,
    now_ticks: u64,
    frame_accum: u64,
    sof_time: u64,

    // Host interrupt line.
    irq_level: bool,
    irq_edge: bool,
    irq_unmask_time: u64,
}

impl OhciController {
    /// `ticks_per_sec` is the rate of the clock feeding `advance_cycles`.
    pub fn new(num_ports: usize, localmem_base: u32, ticks_per_sec: u64) -> Self {
        let frame_ticks = (ticks_per_sec / 1000).max(1);
        let bit_ticks = if ticks_per_sec >= USB_HZ {
            ticks_per_sec / USB_HZ
        } else {
            1
        };
        let mut ohci = Self {
            ctl: 0,
            old_ctl: 0,
            status: 0,
            intr_status: 0,
            intr: 0,
            hcca: 0,
            ctrl_head: 0,
            ctrl_cur: 0,
            bulk_head: 0,
            bulk_cur: 0,
            per_cur: 0,
            done: 0,
            fsmps: 0,
            fit: false,
            fi: 0,
            frt: false,
            frame_number: 0,
            pstart: 0,
            lst: 0,
            rhdesc_a: 0,
            rhdesc_b: 0,
            rhstatus: 0,
            hstatus: 0,
            hmask: 0,
            hreset: 0,
            htest: 0,
            done_count: 7,
            async_slot: AsyncSlot::Idle,
            hub: RootHub::new(num_ports),
            localmem_base,
            frame_ticks,
            bit_ticks,
            now_ticks: 0,
            frame_accum: 0,
            sof_time: 0,
            irq_level: false,
            irq_edge: false,
            irq_unmask_time: 0,
        };
        ohci.reset();
        ohci
    }

    /// Hardware reset. Connected devices stay connected and re-announce
    /// through fresh connect-status changes.
    pub fn reset(&mut self) {
        self.cancel_async_slot();

        self.ctl = 0;
        self.old_ctl = 0;
        self.status = 0;
        self.intr_status = 0;
        self.intr = INTR_MIE;

        self.hcca = 0;
        self.ctrl_head = 0;
        self.ctrl_cur = 0;
        self.bulk_head = 0;
        self.bulk_cur = 0;
        self.per_cur = 0;
        self.done = 0;
        self.done_count = 7;

        self.fsmps = FSMPS_DEFAULT;
        self.fi = FI_DEFAULT;
        self.fit = false;
        self.frt = false;
        self.frame_number = 0;
        self.pstart = 0;
        self.lst = LS_THRESHOLD_DEFAULT;

        self.rhdesc_a = RHA_NPS | self.hub.num_ports() as u32;
        self.rhdesc_b = 0;
        self.rhstatus = 0;

        self.frame_accum = 0;
        self.hub.reset();
    }

    pub fn hub(&self) -> &RootHub {
        &self.hub
    }

    pub fn hub_mut(&mut self) -> &mut RootHub {
        &mut self.hub
    }

    pub fn frame_number(&self) -> u16 {
        self.frame_number
    }

    /// Set externally in tests and by the plugin's snapshot path.
    pub fn set_frame_number(&mut self, frame: u16) {
        self.frame_number = frame;
    }

    pub fn num_ports(&self) -> usize {
        self.hub.num_ports()
    }

    fn hcfs(&self) -> u32 {
        self.ctl & CTL_HCFS
    }

    pub fn is_operational(&self) -> bool {
        self.hcfs() == HCFS_OPERATIONAL
    }

    /// Current level of the host interrupt line.
    pub fn irq_level(&self) -> bool {
        self.irq_level
    }

    /// Consumes a pending rising edge of the interrupt line.
    pub fn take_irq_edge(&mut self) -> bool {
        std::mem::take(&mut self.irq_edge)
    }

    fn intr_update(&mut self) {
        let level = (self.intr & INTR_MIE != 0) && (self.intr_status & self.intr & !INTR_MIE != 0);
        if level && !self.irq_level {
            // Edge spacing. A condition raised inside the window is held
            // until advance_cycles re-evaluates past it.
            if self.now_ticks >= self.irq_unmask_time {
                self.irq_level = true;
                self.irq_edge = true;
                self.irq_unmask_time = self.now_ticks + MIN_IRQ_INTERVAL_TICKS;
            }
        } else if !level {
            self.irq_level = false;
        }
    }

    pub(crate) fn set_interrupt(&mut self, bits: u32) {
        self.intr_status |= bits;
        self.intr_update();
    }

    /// Mounts a device on a root hub port.
    pub fn attach_device(
        &mut self,
        port: usize,
        device: AttachedUsbDevice,
    ) -> Result<(), UsbHubAttachError> {
        let changed = self.hub.attach(port, device)?;
        // A connect event on a suspended bus is a resume trigger.
        if self.hcfs() == HCFS_SUSPEND {
            self.set_interrupt(INTR_RD);
        }
        if changed {
            self.set_interrupt(INTR_RHSC);
        }
        Ok(())
    }

    /// Unplugs a device, cancelling any transfer it still owns.
    pub fn detach_device(&mut self, port: usize) -> Result<AttachedUsbDevice, UsbHubAttachError> {
        let owner_on_port = match &self.async_slot {
            AsyncSlot::Idle => false,
            AsyncSlot::Pending { dev_addr, .. } | AsyncSlot::Complete { dev_addr, .. } => {
                let addr = *dev_addr;
                self.hub
                    .port_mut(port)
                    .and_then(|p| p.device.as_mut())
                    .and_then(|d| d.device_mut_for_address(addr))
                    .is_some()
            }
        };
        if owner_on_port {
            self.async_slot = AsyncSlot::Idle;
        }
        let (device, changed) = self.hub.detach(port)?;
        if changed {
            self.set_interrupt(INTR_RHSC);
        }
        Ok(device)
    }

    /// Advances the controller clock, running frame boundaries as frame
    /// intervals elapse while the bus is operational.
    pub fn advance_cycles<M: MemoryBus + ?Sized>(&mut self, mem: &mut M, ticks: u64) {
        let mut remaining = ticks;
        while remaining > 0 {
            let to_frame = self.frame_ticks - self.frame_accum;
            let step = remaining.min(to_frame);
            self.now_ticks += step;
            self.frame_accum += step;
            remaining -= step;
            if self.frame_accum >= self.frame_ticks {
                self.frame_accum = 0;
                if self.is_operational() {
                    self.frame_boundary(mem);
                }
            }
        }
        self.poll_wakeup();
        // Deliver any edge deferred by the spacing window.
        self.intr_update();
    }

    /// Remote wakeup from suspended downstream devices.
    fn poll_wakeup(&mut self) {
        if !self.hub.poll_remote_wakeup() {
            return;
        }
        if self.hcfs() == HCFS_SUSPEND {
            // The one transition the controller performs on its own.
            self.ctl = (self.ctl & !CTL_HCFS) | HCFS_RESUME;
            self.set_interrupt(INTR_RD);
        } else {
            self.set_interrupt(INTR_RHSC);
        }
    }

    fn set_ctl(&mut self, val: u32) {
        let old_state = self.hcfs();
        self.ctl = val;
        let new_state = self.hcfs();
        if old_state == new_state {
            return;
        }
        match new_state {
            HCFS_OPERATIONAL => {
                // SOF generation (re)starts; lists run from the next frame.
                self.frame_accum = 0;
                self.sof_time = self.now_ticks;
                self.set_interrupt(INTR_SF);
            }
            HCFS_SUSPEND | HCFS_RESUME => {}
            _ => self.reset(),
        }
    }

    fn frame_remaining(&self) -> u32 {
        let frt = if self.frt { FR_FRT } else { 0 };
        if !self.is_operational() {
            return frt;
        }
        let tks = self.now_ticks - self.sof_time;
        if tks >= self.frame_ticks {
            return frt;
        }
        let bits = (tks / self.bit_ticks) as u32;
        frt | (self.fi.wrapping_sub(bits) & FR_MASK)
    }

    fn set_hub_status(&mut self, val: u32) {
        let old = self.rhstatus;

        if val & RHS_OCIC != 0 {
            self.rhstatus &= !RHS_OCIC;
        }
        if val & RHS_LPS != 0 {
            self.hub.power_all(false);
        }
        if val & RHS_LPSC != 0 {
            self.hub.power_all(true);
        }
        if val & RHS_DRWE != 0 {
            self.rhstatus |= RHS_DRWE;
        }
        if val & RHS_CRWE != 0 {
            self.rhstatus &= !RHS_DRWE;
        }
        if old != self.rhstatus {
            self.set_interrupt(INTR_RHSC);
        }
    }

    pub fn mmio_read(&self, addr: u32) -> u32 {
        let addr = addr & 0xff;
        if addr & 3 != 0 {
            warn!("ohci: misaligned register read at {addr:#x}");
            return 0xffff_ffff;
        }
        let ports_end = REG_RH_PORT_STATUS + 4 * self.hub.num_ports() as u32;
        if (REG_RH_PORT_STATUS..ports_end).contains(&addr) {
            let index = ((addr - REG_RH_PORT_STATUS) >> 2) as usize;
            return self.hub.read_port_status(index);
        }
        match addr {
            REG_REVISION => HC_REVISION,
            REG_CONTROL => self.ctl,
            REG_CMD_STATUS => self.status,
            REG_INTR_STATUS => self.intr_status,
            REG_INTR_ENABLE | REG_INTR_DISABLE => self.intr,
            REG_HCCA => self.hcca,
            REG_PERIOD_CURRENT_ED => self.per_cur,
            REG_CONTROL_HEAD_ED => self.ctrl_head,
            REG_CONTROL_CURRENT_ED => self.ctrl_cur,
            REG_BULK_HEAD_ED => self.bulk_head,
            REG_BULK_CURRENT_ED => self.bulk_cur,
            REG_DONE_HEAD => self.done,
            REG_FM_INTERVAL => {
                (if self.fit { FMI_FIT } else { 0 }) | (self.fsmps << 16) | self.fi
            }
            REG_FM_REMAINING => self.frame_remaining(),
            REG_FM_NUMBER => u32::from(self.frame_number),
            REG_PERIODIC_START => self.pstart,
            REG_LS_THRESHOLD => self.lst,
            REG_RH_DESCRIPTOR_A => self.rhdesc_a,
            REG_RH_DESCRIPTOR_B => self.rhdesc_b,
            REG_RH_STATUS => self.rhstatus,
            REG_HSTATUS => self.hstatus & self.hmask,
            REG_HRESET => self.hreset,
            REG_HINTR_ENABLE => self.hmask,
            REG_HINTR_TEST => self.htest,
            _ => {
                warn!("ohci: read of unimplemented register {addr:#x}");
                0xffff_ffff
            }
        }
    }

    pub fn mmio_write(&mut self, addr: u32, val: u32) {
        let addr = addr & 0xff;
        if addr & 3 != 0 {
            warn!("ohci: misaligned register write at {addr:#x}");
            return;
        }
        let ports_end = REG_RH_PORT_STATUS + 4 * self.hub.num_ports() as u32;
        if (REG_RH_PORT_STATUS..ports_end).contains(&addr) {
            let index = ((addr - REG_RH_PORT_STATUS) >> 2) as usize;
            if self.hub.write_port_status(index, val) {
                self.set_interrupt(INTR_RHSC);
            }
            return;
        }
        match addr {
            REG_CONTROL => self.set_ctl(val),
            REG_CMD_STATUS => {
                // SOC is read-only; bits written as zero are unchanged.
                self.status |= val & !STATUS_SOC;
                if self.status & STATUS_HCR != 0 {
                    self.reset();
                }
            }
            REG_INTR_STATUS => {
                self.intr_status &= !val;
                self.intr_update();
            }
            REG_INTR_ENABLE => {
                self.intr |= val;
                self.intr_update();
            }
            REG_INTR_DISABLE => {
                self.intr &= !val;
                self.intr_update();
            }
            REG_HCCA => self.hcca = val & HCCA_MASK,
            // Read-only; some drivers write it anyway.
            REG_PERIOD_CURRENT_ED => {}
            REG_CONTROL_HEAD_ED => self.ctrl_head = val & EDPTR_MASK,
            REG_CONTROL_CURRENT_ED => self.ctrl_cur = val & EDPTR_MASK,
            REG_BULK_HEAD_ED => self.bulk_head = val & EDPTR_MASK,
            REG_BULK_CURRENT_ED => self.bulk_cur = val & EDPTR_MASK,
            REG_FM_INTERVAL => {
                self.fsmps = (val & FMI_FSMPS) >> 16;
                self.fit = val & FMI_FIT != 0;
                self.fi = val & FMI_FI;
            }
            REG_FM_NUMBER => {}
            REG_PERIODIC_START => self.pstart = val & 0xffff,
            REG_LS_THRESHOLD => self.lst = val & 0xffff,
            REG_RH_DESCRIPTOR_A => {
                self.rhdesc_a = (self.rhdesc_a & !RHA_RW_MASK) | (val & RHA_RW_MASK);
            }
            REG_RH_DESCRIPTOR_B => {}
            REG_RH_STATUS => self.set_hub_status(val),
            REG_HSTATUS => self.hstatus &= !(val & self.hmask),
            REG_HRESET => {
                self.hreset = val & !HRESET_FSBIR;
                if val & HRESET_FSBIR != 0 {
                    self.reset();
                }
            }
            REG_HINTR_ENABLE => self.hmask = val,
            REG_HINTR_TEST => self.htest = val,
            _ => warn!("ohci: write of {val:#x} to unimplemented register {addr:#x}"),
        }
    }
}

const TAG_CTL: u16 = 1;
const TAG_STATUS: u16 = 2;
const TAG_INTR_STATUS: u16 = 3;
const TAG_INTR: u16 = 4;
const TAG_HCCA: u16 = 5;
const TAG_CTRL_HEAD: u16 = 6;
const TAG_CTRL_CUR: u16 = 7;
const TAG_BULK_HEAD: u16 = 8;
const TAG_BULK_CUR: u16 = 9;
const TAG_PER_CUR: u16 = 10;
const TAG_DONE: u16 = 11;
const TAG_FM: u16 = 12;
const TAG_FRAME_NUMBER: u16 = 13;
const TAG_PSTART: u16 = 14;
const TAG_LST: u16 = 15;
const TAG_RHDESC_A: u16 = 16;
const TAG_RHDESC_B: u16 = 17;
const TAG_RHSTATUS: u16 = 18;
const TAG_VENDOR: u16 = 19;
const TAG_DONE_COUNT: u16 = 20;
const TAG_ASYNC: u16 = 21;
const TAG_CLOCK: u16 = 22;
const TAG_PORTS: u16 = 23;
const TAG_OLD_CTL: u16 = 24;
const TAG_FRT: u16 = 25;

impl IoSnapshot for OhciController {
    const DEVICE_ID: [u8; 4] = *b"OHCI";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        use io_snapshot::state::codec::Encoder;

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u32(TAG_CTL, self.ctl);
        w.field_u32(TAG_OLD_CTL, self.old_ctl);
        w.field_u32(TAG_STATUS, self.status);
        w.field_u32(TAG_INTR_STATUS, self.intr_status);
        w.field_u32(TAG_INTR, self.intr);
        w.field_u32(TAG_HCCA, self.hcca);
        w.field_u32(TAG_CTRL_HEAD, self.ctrl_head);
        w.field_u32(TAG_CTRL_CUR, self.ctrl_cur);
        w.field_u32(TAG_BULK_HEAD, self.bulk_head);
        w.field_u32(TAG_BULK_CUR, self.bulk_cur);
        w.field_u32(TAG_PER_CUR, self.per_cur);
        w.field_u32(TAG_DONE, self.done);
        w.field_u32(
            TAG_FM,
            (if self.fit { FMI_FIT } else { 0 }) | (self.fsmps << 16) | self.fi,
        );
        w.field_bool(TAG_FRT, self.frt);
        w.field_u16(TAG_FRAME_NUMBER, self.frame_number);
        w.field_u32(TAG_PSTART, self.pstart);
        w.field_u32(TAG_LST, self.lst);
        w.field_u32(TAG_RHDESC_A, self.rhdesc_a);
        w.field_u32(TAG_RHDESC_B, self.rhdesc_b);
        w.field_u32(TAG_RHSTATUS, self.rhstatus);
        w.field_bytes(
            TAG_VENDOR,
            &Encoder::new()
                .u32(self.hstatus)
                .u32(self.hmask)
                .u32(self.hreset)
                .u32(self.htest)
                .finish(),
        );
        w.field_u32(TAG_DONE_COUNT, self.done_count);
        w.field_bytes(TAG_ASYNC, &self.async_slot.encode());
        w.field_bytes(
            TAG_CLOCK,
            &Encoder::new()
                .u64(self.now_ticks)
                .u64(self.frame_accum)
                .u64(self.sof_time)
                .u64(self.irq_unmask_time)
                .bool(self.irq_level)
                .finish(),
        );
        w.field_bytes(TAG_PORTS, &self.hub.save_ports());
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        use io_snapshot::state::codec::Decoder;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        // The device tree is rebuilt first so a corrupt snapshot leaves the
        // running state untouched.
        let hub = RootHub::load_ports(
            r.bytes(TAG_PORTS)
                .ok_or(SnapshotError::InvalidFieldEncoding("missing port state"))?,
        )?;
        if hub.num_ports() != self.hub.num_ports() {
            return Err(SnapshotError::InvalidFieldEncoding("port count mismatch"));
        }

        self.reset();
        self.hub = hub;

        self.ctl = r.u32(TAG_CTL)?.unwrap_or(0);
        self.old_ctl = r.u32(TAG_OLD_CTL)?.unwrap_or(0);
        self.status = r.u32(TAG_STATUS)?.unwrap_or(0);
        self.intr_status = r.u32(TAG_INTR_STATUS)?.unwrap_or(0);
        self.intr = r.u32(TAG_INTR)?.unwrap_or(INTR_MIE);
        self.hcca = r.u32(TAG_HCCA)?.unwrap_or(0);
        self.ctrl_head = r.u32(TAG_CTRL_HEAD)?.unwrap_or(0);
        self.ctrl_cur = r.u32(TAG_CTRL_CUR)?.unwrap_or(0);
        self.bulk_head = r.u32(TAG_BULK_HEAD)?.unwrap_or(0);
        self.bulk_cur = r.u32(TAG_BULK_CUR)?.unwrap_or(0);
        self.per_cur = r.u32(TAG_PER_CUR)?.unwrap_or(0);
        self.done = r.u32(TAG_DONE)?.unwrap_or(0);
        if let Some(fm) = r.u32(TAG_FM)? {
            self.fit = fm & FMI_FIT != 0;
            self.fsmps = (fm & FMI_FSMPS) >> 16;
            self.fi = fm & FMI_FI;
        }
        self.frt = r.bool(TAG_FRT)?.unwrap_or(false);
        self.frame_number = r.u16(TAG_FRAME_NUMBER)?.unwrap_or(0);
        self.pstart = r.u32(TAG_PSTART)?.unwrap_or(0);
        self.lst = r.u32(TAG_LST)?.unwrap_or(LS_THRESHOLD_DEFAULT);
        self.rhdesc_a = r
            .u32(TAG_RHDESC_A)?
            .unwrap_or(RHA_NPS | self.hub.num_ports() as u32);
        self.rhdesc_b = r.u32(TAG_RHDESC_B)?.unwrap_or(0);
        self.rhstatus = r.u32(TAG_RHSTATUS)?.unwrap_or(0);
        if let Some(v) = r.bytes(TAG_VENDOR) {
            let mut d = Decoder::new(v);
            self.hstatus = d.u32()?;
            self.hmask = d.u32()?;
            self.hreset = d.u32()?;
            self.htest = d.u32()?;
            d.finish()?;
        }
        self.done_count = r.u32(TAG_DONE_COUNT)?.unwrap_or(7);
        self.async_slot = match r.bytes(TAG_ASYNC) {
            Some(b) => AsyncSlot::decode(b)?,
            None => AsyncSlot::Idle,
        };
        if let Some(c) = r.bytes(TAG_CLOCK) {
            let mut d = Decoder::new(c);
            self.now_ticks = d.u64()?;
            self.frame_accum = d.u64()?;
            self.sof_time = d.u64()?;
            self.irq_unmask_time = d.u64()?;
            self.irq_level = d.bool()?;
            d.finish()?;
        }
        self.irq_edge = false;
        Ok(())
    }
}

impl OhciController {
    /// A schedule the controller cannot make progress on (cyclic or
    /// runaway). Raises UnrecoverableError instead of hanging the emulator.
    pub(crate) fn unrecoverable(&mut self, why: &str) {
        error!("ohci: unrecoverable schedule error: {why}");
        self.set_interrupt(INTR_UE);
    }
}
