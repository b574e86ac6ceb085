//! Guest-resident schedule structures: endpoint descriptors, transfer
//! descriptors (general and isochronous) and the HCCA.
//!
//! Each structure is kept as raw little-endian dwords with named accessors so
//! that writing back an unmodified descriptor is bit-identical to what the
//! guest driver laid out. Reserved bits are never touched.

use crate::memory::{MemoryAccessError, MemoryBus};
use crate::ohci::regs::DPTR_MASK;

// Completion codes.
pub const CC_NOERROR: u32 = 0x0;
pub const CC_CRC: u32 = 0x1;
pub const CC_BITSTUFFING: u32 = 0x2;
pub const CC_DATATOGGLEMISMATCH: u32 = 0x3;
pub const CC_STALL: u32 = 0x4;
pub const CC_DEVICENOTRESPONDING: u32 = 0x5;
pub const CC_PIDCHECKFAILURE: u32 = 0x6;
pub const CC_UNEXPECTEDPID: u32 = 0x7;
pub const CC_DATAOVERRUN: u32 = 0x8;
pub const CC_DATAUNDERRUN: u32 = 0x9;
pub const CC_NOTACCESSED: u32 = 0xf;

/// Transfer direction field values (ED `D`, TD `DP`).
pub const DIR_SETUP: u32 = 0;
pub const DIR_OUT: u32 = 1;
pub const DIR_IN: u32 = 2;

const ED_FA_MASK: u32 = 0x7f;
const ED_EN_SHIFT: u32 = 7;
const ED_EN_MASK: u32 = 0xf;
const ED_D_SHIFT: u32 = 11;
const ED_D_MASK: u32 = 0x3;
const ED_S: u32 = 1 << 13;
const ED_K: u32 = 1 << 14;
const ED_F: u32 = 1 << 15;
const ED_MPS_SHIFT: u32 = 16;
const ED_MPS_MASK: u32 = 0x7ff;

pub const ED_H: u32 = 1 << 0;
pub const ED_C: u32 = 1 << 1;

/// Endpoint descriptor: control dword, tail pointer, head pointer (with the
/// halted and toggle-carry flags in its low bits) and next-ED link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointDescriptor {
    pub flags: u32,
    pub tail: u32,
    pub head: u32,
    pub next: u32,
}

impl EndpointDescriptor {
    pub fn function_address(&self) -> u8 {
        (self.flags & ED_FA_MASK) as u8
    }

    pub fn endpoint_number(&self) -> u8 {
        ((self.flags >> ED_EN_SHIFT) & ED_EN_MASK) as u8
    }

    pub fn direction(&self) -> u32 {
        (self.flags >> ED_D_SHIFT) & ED_D_MASK
    }

    pub fn is_low_speed(&self) -> bool {
        self.flags & ED_S != 0
    }

    pub fn skip(&self) -> bool {
        self.flags & ED_K != 0
    }

    pub fn is_isochronous(&self) -> bool {
        self.flags & ED_F != 0
    }

    pub fn max_packet_size(&self) -> usize {
        ((self.flags >> ED_MPS_SHIFT) & ED_MPS_MASK) as usize
    }

    pub fn halted(&self) -> bool {
        self.head & ED_H != 0
    }

    pub fn toggle_carry(&self) -> bool {
        self.head & ED_C != 0
    }

    pub fn set_toggle_carry(&mut self, value: bool) {
        if value {
            self.head |= ED_C;
        } else {
            self.head &= !ED_C;
        }
    }

    pub fn set_halted(&mut self) {
        self.head |= ED_H;
    }

    pub fn head_ptr(&self) -> u32 {
        self.head & DPTR_MASK
    }

    pub fn tail_ptr(&self) -> u32 {
        self.tail & DPTR_MASK
    }

    pub fn next_ptr(&self) -> u32 {
        self.next & DPTR_MASK
    }

    /// Unlinks the head TD, preserving the H and C flag bits.
    pub fn set_head_ptr(&mut self, ptr: u32) {
        self.head = (self.head & !DPTR_MASK) | (ptr & DPTR_MASK);
    }
}

const TD_R: u32 = 1 << 18;
const TD_DP_SHIFT: u32 = 19;
const TD_DP_MASK: u32 = 0x3;
const TD_DI_SHIFT: u32 = 21;
const TD_DI_MASK: u32 = 0x7;
const TD_T0: u32 = 1 << 24;
const TD_T1: u32 = 1 << 25;
const TD_EC_SHIFT: u32 = 26;
const TD_EC_MASK: u32 = 0x3;
const TD_CC_SHIFT: u32 = 28;
const TD_CC_MASK: u32 = 0xf;

/// No-interrupt value of the DelayInterrupt field.
pub const TD_DI_NONE: u32 = 7;

/// General transfer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferDescriptor {
    pub flags: u32,
    pub cbp: u32,
    pub next: u32,
    pub be: u32,
}

impl TransferDescriptor {
    pub fn buffer_rounding(&self) -> bool {
        self.flags & TD_R != 0
    }

    pub fn direction_pid(&self) -> u32 {
        (self.flags >> TD_DP_SHIFT) & TD_DP_MASK
    }

    pub fn delay_interrupt(&self) -> u32 {
        (self.flags >> TD_DI_SHIFT) & TD_DI_MASK
    }

    /// The toggle in use: the TD's own T0 when T1 is set, otherwise the
    /// carry bit in the ED head.
    pub fn data_toggle(&self, ed: &EndpointDescriptor) -> bool {
        if self.flags & TD_T1 != 0 {
            self.flags & TD_T0 != 0
        } else {
            ed.toggle_carry()
        }
    }

    /// After a successful transaction the toggle flips and migrates into the
    /// TD (T1 set) so retries of a rewound TD keep the right phase.
    pub fn advance_toggle(&mut self, ed: &mut EndpointDescriptor) {
        self.flags |= TD_T1;
        self.flags ^= TD_T0;
        ed.set_toggle_carry(self.flags & TD_T0 != 0);
    }

    pub fn condition_code(&self) -> u32 {
        (self.flags >> TD_CC_SHIFT) & TD_CC_MASK
    }

    pub fn set_condition_code(&mut self, cc: u32) {
        self.flags = (self.flags & !(TD_CC_MASK << TD_CC_SHIFT)) | ((cc & TD_CC_MASK) << TD_CC_SHIFT);
    }

    pub fn set_error_count(&mut self, ec: u32) {
        self.flags = (self.flags & !(TD_EC_MASK << TD_EC_SHIFT)) | ((ec & TD_EC_MASK) << TD_EC_SHIFT);
    }

    pub fn next_ptr(&self) -> u32 {
        self.next & DPTR_MASK
    }
}

const ISO_SF_MASK: u32 = 0xffff;
const ISO_DI_SHIFT: u32 = 21;
const ISO_DI_MASK: u32 = 0x7;
const ISO_FC_SHIFT: u32 = 24;
const ISO_FC_MASK: u32 = 0x7;
const ISO_CC_SHIFT: u32 = 28;
const ISO_CC_MASK: u32 = 0xf;

const PSW_SIZE_MASK: u16 = 0x7ff;
const PSW_CC_SHIFT: u16 = 12;

pub const PAGE_MASK: u32 = 0xffff_f000;
pub const OFFSET_MASK: u32 = 0x0fff;

/// Isochronous transfer descriptor: four dwords plus eight packet status
/// words addressing up to eight per-frame data packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoTransferDescriptor {
    pub flags: u32,
    pub bp: u32,
    pub next: u32,
    pub be: u32,
    pub offset: [u16; 8],
}

impl IsoTransferDescriptor {
    pub fn starting_frame(&self) -> u16 {
        (self.flags & ISO_SF_MASK) as u16
    }

    pub fn delay_interrupt(&self) -> u32 {
        (self.flags >> ISO_DI_SHIFT) & ISO_DI_MASK
    }

    pub fn frame_count(&self) -> i32 {
        ((self.flags >> ISO_FC_SHIFT) & ISO_FC_MASK) as i32
    }

    pub fn set_condition_code(&mut self, cc: u32) {
        self.flags =
            (self.flags & !(ISO_CC_MASK << ISO_CC_SHIFT)) | ((cc & ISO_CC_MASK) << ISO_CC_SHIFT);
    }

    pub fn next_ptr(&self) -> u32 {
        self.next & DPTR_MASK
    }

    pub fn psw_cc(&self, slot: usize) -> u16 {
        self.offset[slot] >> PSW_CC_SHIFT
    }

    pub fn set_psw(&mut self, slot: usize, cc: u32, size: usize) {
        self.offset[slot] = (((cc as u16) & 0xf) << PSW_CC_SHIFT) | (size as u16 & PSW_SIZE_MASK);
    }
}

pub fn read_ed<M: MemoryBus + ?Sized>(
    mem: &mut M,
    addr: u32,
) -> Result<EndpointDescriptor, MemoryAccessError> {
    Ok(EndpointDescriptor {
        flags: mem.read_u32(addr)?,
        tail: mem.read_u32(addr + 4)?,
        head: mem.read_u32(addr + 8)?,
        next: mem.read_u32(addr + 12)?,
    })
}

pub fn write_ed<M: MemoryBus + ?Sized>(
    mem: &mut M,
    addr: u32,
    ed: &EndpointDescriptor,
) -> Result<(), MemoryAccessError> {
    mem.write_u32(addr, ed.flags)?;
    mem.write_u32(addr + 4, ed.tail)?;
    mem.write_u32(addr + 8, ed.head)?;
    mem.write_u32(addr + 12, ed.next)
}

pub fn read_td<M: MemoryBus + ?Sized>(
    mem: &mut M,
    addr: u32,
) -> Result<TransferDescriptor, MemoryAccessError> {
    Ok(TransferDescriptor {
        flags: mem.read_u32(addr)?,
        cbp: mem.read_u32(addr + 4)?,
        next: mem.read_u32(addr + 8)?,
        be: mem.read_u32(addr + 12)?,
    })
}

pub fn write_td<M: MemoryBus + ?Sized>(
    mem: &mut M,
    addr: u32,
    td: &TransferDescriptor,
) -> Result<(), MemoryAccessError> {
    mem.write_u32(addr, td.flags)?;
    mem.write_u32(addr + 4, td.cbp)?;
    mem.write_u32(addr + 8, td.next)?;
    mem.write_u32(addr + 12, td.be)
}

pub fn read_iso_td<M: MemoryBus + ?Sized>(
    mem: &mut M,
    addr: u32,
) -> Result<IsoTransferDescriptor, MemoryAccessError> {
    let mut td = IsoTransferDescriptor {
        flags: mem.read_u32(addr)?,
        bp: mem.read_u32(addr + 4)?,
        next: mem.read_u32(addr + 8)?,
        be: mem.read_u32(addr + 12)?,
        offset: [0; 8],
    };
    for (i, slot) in td.offset.iter_mut().enumerate() {
        *slot = mem.read_u16(addr + 16 + 2 * i as u32)?;
    }
    Ok(td)
}

pub fn write_iso_td<M: MemoryBus + ?Sized>(
    mem: &mut M,
    addr: u32,
    td: &IsoTransferDescriptor,
) -> Result<(), MemoryAccessError> {
    mem.write_u32(addr, td.flags)?;
    mem.write_u32(addr + 4, td.bp)?;
    mem.write_u32(addr + 8, td.next)?;
    mem.write_u32(addr + 12, td.be)?;
    for (i, slot) in td.offset.iter().enumerate() {
        mem.write_u16(addr + 16 + 2 * i as u32, *slot)?;
    }
    Ok(())
}

// HCCA layout.
pub const HCCA_INTR_TABLE: u32 = 0x00;
pub const HCCA_FRAME: u32 = 0x80;
pub const HCCA_DONE_HEAD: u32 = 0x84;

pub fn read_hcca_intr<M: MemoryBus + ?Sized>(
    mem: &mut M,
    hcca: u32,
    index: u32,
) -> Result<u32, MemoryAccessError> {
    mem.read_u32(hcca + HCCA_INTR_TABLE + 4 * (index & 0x1f))
}

pub fn write_hcca_frame<M: MemoryBus + ?Sized>(
    mem: &mut M,
    hcca: u32,
    frame: u16,
) -> Result<(), MemoryAccessError> {
    mem.write_u16(hcca + HCCA_FRAME, frame)?;
    mem.write_u16(hcca + HCCA_FRAME + 2, 0)
}

pub fn write_hcca_done_head<M: MemoryBus + ?Sized>(
    mem: &mut M,
    hcca: u32,
    done: u32,
) -> Result<(), MemoryAccessError> {
    mem.write_u32(hcca + HCCA_DONE_HEAD, done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed_field_extraction() {
        // fa=0x15, en=3, d=IN, low speed, mps=64
        let flags = 0x15 | (3 << 7) | (DIR_IN << 11) | (1 << 13) | (64 << 16);
        let ed = EndpointDescriptor {
            flags,
            tail: 0x2000,
            head: 0x1000 | ED_C,
            next: 0x3000,
        };
        assert_eq!(ed.function_address(), 0x15);
        assert_eq!(ed.endpoint_number(), 3);
        assert_eq!(ed.direction(), DIR_IN);
        assert!(ed.is_low_speed());
        assert!(!ed.skip());
        assert!(!ed.is_isochronous());
        assert_eq!(ed.max_packet_size(), 64);
        assert!(ed.toggle_carry());
        assert!(!ed.halted());
        assert_eq!(ed.head_ptr(), 0x1000);
    }

    #[test]
    fn head_ptr_update_preserves_flags() {
        let mut ed = EndpointDescriptor {
            head: 0x1000 | ED_C | ED_H,
            ..Default::default()
        };
        ed.set_head_ptr(0xabc0);
        assert_eq!(ed.head, 0xabc0 | ED_C | ED_H);
    }

    #[test]
    fn td_toggle_resolution() {
        let mut ed = EndpointDescriptor::default();
        let mut td = TransferDescriptor::default();
        // T1 clear: toggle comes from the ED carry.
        assert!(!td.data_toggle(&ed));
        ed.set_toggle_carry(true);
        assert!(td.data_toggle(&ed));
        // After advancing, the TD owns the toggle.
        td.advance_toggle(&mut ed);
        assert!(!td.data_toggle(&ed));
        assert!(!ed.toggle_carry());
        td.advance_toggle(&mut ed);
        assert!(td.data_toggle(&ed));
        assert!(ed.toggle_carry());
    }

    #[test]
    fn td_condition_code_update_is_masked() {
        let mut td = TransferDescriptor {
            flags: 0xf000_0000 | (1 << 18),
            ..Default::default()
        };
        td.set_condition_code(CC_STALL);
        assert_eq!(td.condition_code(), CC_STALL);
        assert!(td.buffer_rounding());
    }

    #[test]
    fn iso_psw_encoding() {
        let mut td = IsoTransferDescriptor::default();
        td.set_psw(2, CC_NOERROR, 0x123);
        assert_eq!(td.offset[2], 0x0123);
        td.set_psw(3, CC_DATAUNDERRUN, 0);
        assert_eq!(td.psw_cc(3), CC_DATAUNDERRUN as u16);
    }

    #[test]
    fn descriptor_io_round_trips() {
        struct Ram(Vec<u8>);
        impl MemoryBus for Ram {
            fn read_physical(
                &mut self,
                addr: u32,
                buf: &mut [u8],
            ) -> Result<(), MemoryAccessError> {
                let a = addr as usize;
                buf.copy_from_slice(&self.0[a..a + buf.len()]);
                Ok(())
            }
            fn write_physical(&mut self, addr: u32, buf: &[u8]) -> Result<(), MemoryAccessError> {
                let a = addr as usize;
                self.0[a..a + buf.len()].copy_from_slice(buf);
                Ok(())
            }
        }

        let mut ram = Ram(vec![0; 0x100]);
        let td = IsoTransferDescriptor {
            flags: 0x1234_5678,
            bp: 0x9abc_d000,
            next: 0x40,
            be: 0x9abc_dfff,
            offset: [0xe000, 0xe001, 0, 0, 0, 0, 0, 0xffff],
        };
        write_iso_td(&mut ram, 0x20, &td).unwrap();
        assert_eq!(read_iso_td(&mut ram, 0x20).unwrap(), td);

        let ed = EndpointDescriptor {
            flags: 0xdead_beef,
            tail: 1,
            head: 2,
            next: 3,
        };
        write_ed(&mut ram, 0x60, &ed).unwrap();
        assert_eq!(read_ed(&mut ram, 0x60).unwrap(), ed);
    }
}
