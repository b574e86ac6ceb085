//! Shared scaffolding for controller integration tests: a bounds-checked
//! guest RAM, a bump allocator for laying out schedules, and descriptor
//! builders.

#![allow(dead_code)]

use usb_ohci::device::AttachedUsbDevice;
use usb_ohci::memory::{MemoryAccessError, MemoryBus};
use usb_ohci::ohci::descriptor::{
    self as desc, EndpointDescriptor, IsoTransferDescriptor, TransferDescriptor,
};
use usb_ohci::ohci::regs::*;
use usb_ohci::ohci::{OhciController, USB_HZ};
use usb_ohci::{SetupPacket, UsbDeviceModel};

/// Controller clock ticks per 1 ms frame when clocked at the USB wire rate.
pub const TICKS_PER_FRAME: u64 = USB_HZ / 1000;

/// `RUST_LOG=usb_ohci=trace cargo test` shows controller traces.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct TestMemory {
    pub ram: Vec<u8>,
}

impl TestMemory {
    pub fn new(size: usize) -> Self {
        Self { ram: vec![0; size] }
    }

    pub fn bytes(&self, addr: u32, len: usize) -> &[u8] {
        &self.ram[addr as usize..addr as usize + len]
    }

    pub fn set_bytes(&mut self, addr: u32, data: &[u8]) {
        self.ram[addr as usize..addr as usize + data.len()].copy_from_slice(data);
    }

    pub fn u16_at(&self, addr: u32) -> u16 {
        let a = addr as usize;
        u16::from_le_bytes([self.ram[a], self.ram[a + 1]])
    }

    pub fn u32_at(&self, addr: u32) -> u32 {
        let a = addr as usize;
        u32::from_le_bytes([self.ram[a], self.ram[a + 1], self.ram[a + 2], self.ram[a + 3]])
    }
}

impl MemoryBus for TestMemory {
    fn read_physical(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryAccessError> {
        let a = addr as usize;
        match a.checked_add(buf.len()).filter(|&e| e <= self.ram.len()) {
            Some(end) => {
                buf.copy_from_slice(&self.ram[a..end]);
                Ok(())
            }
            None => Err(MemoryAccessError {
                addr,
                len: buf.len(),
            }),
        }
    }

    fn write_physical(&mut self, addr: u32, buf: &[u8]) -> Result<(), MemoryAccessError> {
        let a = addr as usize;
        match a.checked_add(buf.len()).filter(|&e| e <= self.ram.len()) {
            Some(end) => {
                self.ram[a..end].copy_from_slice(buf);
                Ok(())
            }
            None => Err(MemoryAccessError {
                addr,
                len: buf.len(),
            }),
        }
    }
}

/// Bump allocator for guest structures.
pub struct Alloc(u32);

impl Alloc {
    pub fn new(start: u32) -> Self {
        Alloc(start)
    }

    pub fn take(&mut self, size: u32) -> u32 {
        // Descriptors need 16-byte alignment; keep everything aligned.
        let addr = (self.0 + 15) & !15;
        self.0 = addr + size;
        addr
    }
}

pub fn ed_flags(fa: u8, ep: u8, dir: u32, mps: u32) -> u32 {
    u32::from(fa) | (u32::from(ep) << 7) | (dir << 11) | (mps << 16)
}

pub fn iso_ed_flags(fa: u8, ep: u8, dir: u32, mps: u32) -> u32 {
    ed_flags(fa, ep, dir, mps) | (1 << 15)
}

/// General TD flags: direction PID, DelayInterrupt, rounding allowed.
pub fn td_flags(dp: u32, di: u32, rounding: bool) -> u32 {
    (if rounding { 1 << 18 } else { 0 })
        | (dp << 19)
        | (di << 21)
        | (desc::CC_NOTACCESSED << 28)
}

pub fn put_ed(mem: &mut TestMemory, addr: u32, flags: u32, head: u32, tail: u32, next: u32) {
    desc::write_ed(
        mem,
        addr,
        &EndpointDescriptor {
            flags,
            tail,
            head,
            next,
        },
    )
    .unwrap();
}

pub fn put_td(mem: &mut TestMemory, addr: u32, flags: u32, cbp: u32, next: u32, be: u32) {
    desc::write_td(
        mem,
        addr,
        &TransferDescriptor {
            flags,
            cbp,
            next,
            be,
        },
    )
    .unwrap();
}

pub fn put_iso_td(
    mem: &mut TestMemory,
    addr: u32,
    starting_frame: u16,
    frame_count: u32,
    di: u32,
    bp: u32,
    be: u32,
    next: u32,
    offsets: &[u16],
) {
    let mut td = IsoTransferDescriptor {
        flags: u32::from(starting_frame)
            | (di << 21)
            | (frame_count << 24)
            | (desc::CC_NOTACCESSED << 28),
        bp,
        next,
        be,
        offset: [0; 8],
    };
    for (slot, &off) in offsets.iter().enumerate() {
        // Unaccessed slots carry the NotAccessed code above the offset.
        td.offset[slot] = 0xe000 | off;
    }
    desc::write_iso_td(mem, addr, &td).unwrap();
}

pub fn read_ed(mem: &mut TestMemory, addr: u32) -> EndpointDescriptor {
    desc::read_ed(mem, addr).unwrap()
}

pub fn read_td(mem: &mut TestMemory, addr: u32) -> TransferDescriptor {
    desc::read_td(mem, addr).unwrap()
}

pub fn read_iso_td(mem: &mut TestMemory, addr: u32) -> IsoTransferDescriptor {
    desc::read_iso_td(mem, addr).unwrap()
}

pub fn setup_bytes(rt: u8, req: u8, value: u16, index: u16, len: u16) -> [u8; 8] {
    SetupPacket {
        bm_request_type: rt,
        b_request: req,
        w_value: value,
        w_index: index,
        w_length: len,
    }
    .to_bytes()
}

/// Attaches a model to a root port and runs the bus reset that enables it.
pub fn attach_enabled(
    controller: &mut OhciController,
    port: usize,
    model: Box<dyn UsbDeviceModel>,
) {
    init_logging();
    controller
        .attach_device(port, AttachedUsbDevice::new(model))
        .unwrap();
    let reg = REG_RH_PORT_STATUS + 4 * port as u32;
    controller.mmio_write(reg, PORT_CSC);
    controller.mmio_write(reg, PORT_PRS);
    assert_ne!(controller.mmio_read(reg) & PORT_PES, 0);
}

pub fn run_frames(controller: &mut OhciController, mem: &mut TestMemory, frames: u64) {
    controller.advance_cycles(mem, frames * TICKS_PER_FRAME);
}

/// A control/bulk schedule laid out in guest memory: one ED whose TD chain
/// ends in an unreachable placeholder TD.
pub struct SingleEd {
    pub ed: u32,
    pub tds: Vec<u32>,
    pub tail: u32,
}

/// Builds an ED with the given TD chain. `tds` supplies (flags, cbp, be) per
/// TD; next pointers and the tail placeholder are wired up here.
pub fn build_ed(
    mem: &mut TestMemory,
    alloc: &mut Alloc,
    ed_flags: u32,
    tds: &[(u32, u32, u32)],
) -> SingleEd {
    let ed = alloc.take(16);
    let td_addrs: Vec<u32> = tds.iter().map(|_| alloc.take(16)).collect();
    let tail = alloc.take(16);
    for (i, &(flags, cbp, be)) in tds.iter().enumerate() {
        let next = td_addrs.get(i + 1).copied().unwrap_or(tail);
        put_td(mem, td_addrs[i], flags, cbp, next, be);
    }
    let head = td_addrs.first().copied().unwrap_or(tail);
    put_ed(mem, ed, ed_flags, head, tail, 0);
    SingleEd {
        ed,
        tds: td_addrs,
        tail,
    }
}

/// Points every HCCA interrupt table slot at the same ED.
pub fn fill_periodic_table(mem: &mut TestMemory, hcca: u32, ed: u32) {
    for i in 0..32 {
        mem.write_u32(hcca + 4 * i, ed).unwrap();
    }
}
