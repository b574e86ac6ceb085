//! Frame boundary processing: periodic/control/bulk list walking, general
//! and isochronous TD service, the done queue and the single pending-packet
//! slot for deferred transfers.

use log::{trace, warn};

use crate::memory::{buffer_len, copy_from_guest, copy_to_guest, MemoryBus, OffsetBus};
use crate::ohci::descriptor::{self as desc, EndpointDescriptor};
use crate::ohci::regs::*;
use crate::ohci::OhciController;
use crate::{AsyncResult, UsbInResult, UsbOutResult};
use io_snapshot::state::codec::{Decoder, Encoder};
use io_snapshot::state::{SnapshotError, SnapshotResult};

/// Upper bound on EDs walked per list per frame. A busier schedule than this
/// is a guest-constructed loop.
const ED_WALK_LIMIT: usize = 256;
/// Upper bound on TDs serviced per ED per frame.
const TD_WALK_LIMIT: usize = 128;

/// The one in-flight deferred transfer. The hardware allows an active packet
/// per endpoint; one per controller is enough for devices that answer within
/// a frame or two.
pub(crate) enum AsyncSlot {
    Idle,
    /// Submitted to the device, not yet resolved.
    Pending {
        td_addr: u32,
        dev_addr: u8,
        endpoint: u8,
    },
    /// Resolved; consumed the next time the TD is serviced.
    Complete {
        td_addr: u32,
        dev_addr: u8,
        result: AsyncResult,
    },
}

impl AsyncSlot {
    pub(crate) fn encode(&self) -> Vec<u8> {
        match self {
            // A completed-but-unconsumed packet is saved as pending; the
            // device is simply polled again after restore.
            AsyncSlot::Idle => Encoder::new().u8(0).finish(),
            AsyncSlot::Pending {
                td_addr,
                dev_addr,
                endpoint,
            } => Encoder::new()
                .u8(1)
                .u32(*td_addr)
                .u8(*dev_addr)
                .u8(*endpoint)
                .finish(),
            AsyncSlot::Complete {
                td_addr, dev_addr, ..
            } => Encoder::new()
                .u8(1)
                .u32(*td_addr)
                .u8(*dev_addr)
                .u8(0)
                .finish(),
        }
    }

    pub(crate) fn decode(bytes: &[u8]) -> SnapshotResult<Self> {
        let mut d = Decoder::new(bytes);
        let slot = match d.u8()? {
            0 => AsyncSlot::Idle,
            1 => AsyncSlot::Pending {
                td_addr: d.u32()?,
                dev_addr: d.u8()?,
                endpoint: d.u8()?,
            },
            _ => return Err(SnapshotError::InvalidFieldEncoding("async slot state")),
        };
        d.finish()?;
        Ok(slot)
    }
}

/// Device answer, normalized across token kinds.
enum TokenResult {
    In(Vec<u8>),
    OutAck,
    Nak,
    Stall,
    Timeout,
    Deferred,
    BadDirection,
}

impl From<UsbInResult> for TokenResult {
    fn from(r: UsbInResult) -> Self {
        match r {
            UsbInResult::Data(d) => TokenResult::In(d),
            UsbInResult::Nak => TokenResult::Nak,
            UsbInResult::Stall => TokenResult::Stall,
            UsbInResult::Timeout => TokenResult::Timeout,
            UsbInResult::Async => TokenResult::Deferred,
        }
    }
}

impl From<UsbOutResult> for TokenResult {
    fn from(r: UsbOutResult) -> Self {
        match r {
            UsbOutResult::Ack => TokenResult::OutAck,
            UsbOutResult::Nak => TokenResult::Nak,
            UsbOutResult::Stall => TokenResult::Stall,
            UsbOutResult::Timeout => TokenResult::Timeout,
            UsbOutResult::Async => TokenResult::Deferred,
        }
    }
}

impl OhciController {
    /// One millisecond of bus time: periodic schedule, control/bulk
    /// schedule, done queue publication, SOF.
    pub(crate) fn frame_boundary<M: MemoryBus + ?Sized>(&mut self, mem: &mut M) {
        let base = self.localmem_base;
        let mut bus = OffsetBus::new(mem, base);

        self.pump_async();

        if self.ctl & CTL_PLE != 0 && self.hcca != 0 {
            let index = u32::from(self.frame_number) & 0x1f;
            match desc::read_hcca_intr(&mut bus, self.hcca, index) {
                Ok(head) => {
                    self.service_ed_list(&mut bus, head);
                }
                Err(e) => warn!("ohci: HCCA read failed: {e}"),
            }
        }

        // Disabling a list cancels the packet it had in flight.
        if !matches!(self.async_slot, AsyncSlot::Idle)
            && self.old_ctl & !self.ctl & (CTL_CLE | CTL_BLE) != 0
        {
            self.cancel_async_slot();
        }
        self.old_ctl = self.ctl;

        self.process_lists(&mut bus);

        self.frt = self.fit;

        self.frame_number = self.frame_number.wrapping_add(1);
        if self.frame_number == 0 {
            self.set_interrupt(INTR_FNO);
        }
        if self.hcca != 0 {
            if let Err(e) = desc::write_hcca_frame(&mut bus, self.hcca, self.frame_number) {
                warn!("ohci: HCCA frame writeback failed: {e}");
            }
        }

        if self.done_count == 0 && self.intr_status & INTR_WD == 0 {
            if self.done == 0 {
                // Countdown expired with nothing retired; re-arm.
                self.done_count = 7;
            } else {
                let mut done = self.done;
                if self.intr & !INTR_MIE & self.intr_status != 0 {
                    done |= 1;
                }
                if self.hcca != 0 {
                    if let Err(e) = desc::write_hcca_done_head(&mut bus, self.hcca, done) {
                        warn!("ohci: HCCA done head writeback failed: {e}");
                    }
                }
                self.done = 0;
                self.done_count = 7;
                self.set_interrupt(INTR_WD);
            }
        }
        if self.done_count != 7 && self.done_count != 0 {
            self.done_count -= 1;
        }

        // SOF.
        self.sof_time = self.now_ticks;
        self.set_interrupt(INTR_SF);
    }

    /// Asks the pending packet's owner whether it has finished.
    fn pump_async(&mut self) {
        let AsyncSlot::Pending {
            td_addr,
            dev_addr,
            endpoint,
        } = self.async_slot
        else {
            return;
        };
        match self.hub.route(dev_addr) {
            Some(dev) => {
                if let Some(completion) = dev.poll_async() {
                    if completion.endpoint == endpoint {
                        self.async_slot = AsyncSlot::Complete {
                            td_addr,
                            dev_addr,
                            result: completion.result,
                        };
                    }
                }
            }
            // Owner vanished; the TD is re-dispatched and times out.
            None => self.async_slot = AsyncSlot::Idle,
        }
    }

    pub(crate) fn cancel_async_slot(&mut self) {
        if let AsyncSlot::Pending { dev_addr, .. } | AsyncSlot::Complete { dev_addr, .. } =
            self.async_slot
        {
            if let Some(dev) = self.hub.route(dev_addr) {
                dev.cancel_async();
            }
        }
        self.async_slot = AsyncSlot::Idle;
    }

    fn process_lists<M: MemoryBus + ?Sized>(&mut self, mem: &mut M) {
        if self.ctl & CTL_CLE != 0 && self.status & STATUS_CLF != 0 {
            if !self.service_ed_list(mem, self.ctrl_head) {
                self.ctrl_cur = 0;
                self.status &= !STATUS_CLF;
            }
        }
        if self.ctl & CTL_BLE != 0 && self.status & STATUS_BLF != 0 {
            if !self.service_ed_list(mem, self.bulk_head) {
                self.bulk_cur = 0;
                self.status &= !STATUS_BLF;
            }
        }
    }

    /// Walks an ED chain. Returns true if any ED had transfers outstanding.
    fn service_ed_list<M: MemoryBus + ?Sized>(&mut self, mem: &mut M, head: u32) -> bool {
        if head == 0 {
            return false;
        }
        let mut active = false;
        let mut visited: Vec<u32> = Vec::new();
        let mut cur = head & EDPTR_MASK;
        while cur != 0 {
            if visited.contains(&cur) || visited.len() >= ED_WALK_LIMIT {
                self.unrecoverable("endpoint list loops");
                break;
            }
            visited.push(cur);

            let mut ed = match desc::read_ed(mem, cur) {
                Ok(ed) => ed,
                Err(e) => {
                    warn!("ohci: ED read failed at {cur:#x}: {e}");
                    break;
                }
            };
            let next = ed.next_ptr();

            if ed.halted() || ed.skip() {
                // A paused endpoint abandons its in-flight packet.
                let head_td = ed.head_ptr();
                if let AsyncSlot::Pending { td_addr, .. } | AsyncSlot::Complete { td_addr, .. } =
                    self.async_slot
                {
                    if td_addr == head_td {
                        self.cancel_async_slot();
                    }
                }
                cur = next;
                continue;
            }

            let mut tds = 0;
            while ed.head_ptr() != ed.tail_ptr() {
                active = true;
                tds += 1;
                if tds > TD_WALK_LIMIT {
                    self.unrecoverable("transfer list loops");
                    break;
                }
                let stop = if ed.is_isochronous() {
                    self.service_iso_td(mem, &mut ed)
                } else {
                    self.service_td(mem, &mut ed)
                };
                if stop {
                    break;
                }
            }

            if let Err(e) = desc::write_ed(mem, cur, &ed) {
                warn!("ohci: ED writeback failed at {cur:#x}: {e}");
                break;
            }
            cur = next;
        }
        active
    }

    /// Services the TD at the head of `ed`. Returns true to stop servicing
    /// this endpoint for the rest of the frame.
    fn service_td<M: MemoryBus + ?Sized>(
        &mut self,
        mem: &mut M,
        ed: &mut EndpointDescriptor,
    ) -> bool {
        let addr = ed.head_ptr();

        // A packet already handed to a device blocks its TD until resolved.
        let completion = matches!(&self.async_slot, AsyncSlot::Complete { td_addr, .. } if *td_addr == addr);
        if matches!(&self.async_slot, AsyncSlot::Pending { td_addr, .. } if *td_addr == addr) {
            return true;
        }

        let mut td = match desc::read_td(mem, addr) {
            Ok(td) => td,
            Err(e) => {
                warn!("ohci: TD read failed at {addr:#x}: {e}");
                self.unrecoverable("unreadable transfer descriptor");
                return true;
            }
        };

        let dir = match ed.direction() {
            d @ (desc::DIR_OUT | desc::DIR_IN) => d,
            _ => td.direction_pid(),
        };

        let len = buffer_len(td.cbp, td.be);
        let mut buf = vec![0u8; len];
        if len > 0 && dir != desc::DIR_IN && !completion {
            if let Err(e) = copy_from_guest(mem, td.cbp, td.be, &mut buf) {
                warn!("ohci: TD payload read failed: {e}");
                self.unrecoverable("unreadable transfer payload");
                return true;
            }
        }
        let flag_r = td.buffer_rounding();

        let result = if completion {
            let AsyncSlot::Complete { result, .. } =
                std::mem::replace(&mut self.async_slot, AsyncSlot::Idle)
            else {
                unreachable!()
            };
            match result {
                AsyncResult::In(r) => TokenResult::from(r),
                AsyncResult::Out(r) => TokenResult::from(r),
            }
        } else {
            // One deferred packet at a time across the whole controller.
            if !matches!(self.async_slot, AsyncSlot::Idle) {
                return true;
            }
            let fa = ed.function_address();
            let ep = ed.endpoint_number();
            match self.hub.route(fa) {
                None => TokenResult::Timeout,
                Some(dev) => match dir {
                    desc::DIR_IN => TokenResult::from(dev.handle_in_token(ep, len)),
                    desc::DIR_OUT => TokenResult::from(dev.handle_out_token(ep, &buf)),
                    desc::DIR_SETUP => TokenResult::from(dev.handle_setup_token(&buf)),
                    _ => TokenResult::BadDirection,
                },
            }
        };

        if let TokenResult::Deferred = result {
            trace!("ohci: TD {addr:#x} deferred");
            self.async_slot = AsyncSlot::Pending {
                td_addr: addr,
                dev_addr: ed.function_address(),
                endpoint: ed.endpoint_number(),
            };
            return true;
        }
        if let TokenResult::Nak = result {
            // NAK never retires or halts; retried next frame.
            return true;
        }

        match result {
            TokenResult::In(data) => {
                if data.len() > len {
                    td.set_condition_code(desc::CC_DATAOVERRUN);
                    ed.set_halted();
                } else {
                    if let Err(e) = copy_to_guest(mem, td.cbp, td.be, &data) {
                        warn!("ohci: TD payload write failed: {e}");
                        self.unrecoverable("unwritable transfer payload");
                        return true;
                    }
                    let ret = data.len();
                    if ret == len || flag_r {
                        // Short IN reads are fine when buffer rounding is set.
                        self.td_success(&mut td, ed, ret, len);
                    } else {
                        td.set_condition_code(desc::CC_DATAUNDERRUN);
                        ed.set_halted();
                    }
                }
            }
            TokenResult::OutAck => self.td_success(&mut td, ed, len, len),
            TokenResult::Stall => {
                td.set_condition_code(desc::CC_STALL);
                ed.set_halted();
            }
            TokenResult::Timeout => {
                td.set_condition_code(desc::CC_DEVICENOTRESPONDING);
                ed.set_halted();
            }
            TokenResult::BadDirection => {
                warn!("ohci: TD {addr:#x} has invalid direction");
                td.set_condition_code(desc::CC_UNEXPECTEDPID);
                td.set_error_count(3);
                ed.set_halted();
            }
            TokenResult::Nak | TokenResult::Deferred => unreachable!(),
        }

        // Retire: unlink from the ED and push onto the done queue.
        ed.set_head_ptr(td.next_ptr());
        td.next = self.done;
        self.done = addr;
        let di = td.delay_interrupt();
        if di < self.done_count {
            self.done_count = di;
        }
        if let Err(e) = desc::write_td(mem, addr, &td) {
            warn!("ohci: TD writeback failed at {addr:#x}: {e}");
        }
        td.condition_code() != desc::CC_NOERROR
    }

    fn td_success(
        &mut self,
        td: &mut desc::TransferDescriptor,
        ed: &mut EndpointDescriptor,
        ret: usize,
        len: usize,
    ) {
        if ret == len {
            td.cbp = 0;
        } else {
            td.cbp = td.cbp.wrapping_add(ret as u32);
            if (td.cbp & 0xfff) as usize + ret > 0xfff {
                td.cbp = (td.cbp & 0xfff) | (td.be & !0xfff);
            }
        }
        td.advance_toggle(ed);
        td.set_condition_code(desc::CC_NOERROR);
        td.set_error_count(0);
    }

    /// Services the isochronous TD at the head of `ed` for the current
    /// frame. Returns true to stop servicing this endpoint.
    fn service_iso_td<M: MemoryBus + ?Sized>(
        &mut self,
        mem: &mut M,
        ed: &mut EndpointDescriptor,
    ) -> bool {
        let addr = ed.head_ptr();
        let mut td = match desc::read_iso_td(mem, addr) {
            Ok(td) => td,
            Err(e) => {
                warn!("ohci: ISO TD read failed at {addr:#x}: {e}");
                self.unrecoverable("unreadable isochronous descriptor");
                return true;
            }
        };

        let frame_count = td.frame_count();
        // Signed distance into the TD's frame window.
        let relative = self.frame_number.wrapping_sub(td.starting_frame()) as i16 as i32;

        if relative < 0 {
            // Window not open yet.
            return true;
        }
        if relative > frame_count {
            // Expired: the whole TD retires with an overrun and the next ISO
            // TD of this endpoint is considered within the same frame.
            td.set_condition_code(desc::CC_DATAOVERRUN);
            ed.set_head_ptr(td.next_ptr());
            td.next = self.done;
            self.done = addr;
            let di = td.delay_interrupt();
            if di < self.done_count {
                self.done_count = di;
            }
            if let Err(e) = desc::write_iso_td(mem, addr, &td) {
                warn!("ohci: ISO TD writeback failed at {addr:#x}: {e}");
            }
            return false;
        }
        let slot = relative as usize;

        let dir = ed.direction();
        if !matches!(dir, desc::DIR_IN | desc::DIR_OUT | desc::DIR_SETUP) {
            warn!("ohci: ISO TD {addr:#x} endpoint has invalid direction");
            return true;
        }

        if td.bp == 0 || td.be == 0 {
            warn!("ohci: ISO TD {addr:#x} has null buffer pointers");
            return true;
        }

        let start_offset = td.offset[slot];
        let next_offset = if relative < frame_count {
            td.offset[slot + 1]
        } else {
            0
        };

        // Slots must still read "not accessed".
        if td.psw_cc(slot) & 0xe == 0
            || (relative < frame_count && (next_offset >> 12) & 0xe == 0)
        {
            warn!("ohci: ISO TD {addr:#x} slot already accessed");
            return true;
        }
        if relative < frame_count && start_offset > next_offset {
            warn!("ohci: ISO TD {addr:#x} has unordered packet offsets");
            return true;
        }

        // Bit 12 of the offset selects between the BP0 and BE pages.
        let page = |offset: u16| -> u32 {
            if offset & 0x1000 == 0 {
                td.bp & desc::PAGE_MASK
            } else {
                td.be & desc::PAGE_MASK
            }
        };
        let start_addr = page(start_offset) | u32::from(start_offset) & desc::OFFSET_MASK;
        let end_addr = if relative < frame_count {
            let end_offset = next_offset.wrapping_sub(1);
            page(end_offset) | u32::from(end_offset) & desc::OFFSET_MASK
        } else {
            td.be
        };

        let len = if start_addr & desc::PAGE_MASK != end_addr & desc::PAGE_MASK {
            ((end_addr & desc::OFFSET_MASK) + 0x1001 - (start_addr & desc::OFFSET_MASK)) as usize
        } else {
            (end_addr.wrapping_sub(start_addr) + 1) as usize
        };

        let mut buf = vec![0u8; len];
        if len > 0 && dir != desc::DIR_IN {
            if let Err(e) = copy_from_guest(mem, start_addr, end_addr, &mut buf) {
                warn!("ohci: ISO payload read failed: {e}");
                self.unrecoverable("unreadable isochronous payload");
                return true;
            }
        }

        let fa = ed.function_address();
        let ep = ed.endpoint_number();
        let result = match self.hub.route(fa) {
            None => TokenResult::Timeout,
            Some(dev) => match dir {
                desc::DIR_IN => TokenResult::from(dev.handle_in_token(ep, len)),
                desc::DIR_OUT => TokenResult::from(dev.handle_out_token(ep, &buf)),
                _ => TokenResult::from(dev.handle_setup_token(&buf)),
            },
        };

        match result {
            TokenResult::In(data) => {
                if data.len() > len {
                    td.set_psw(slot, desc::CC_DATAOVERRUN, len);
                } else {
                    if let Err(e) = copy_to_guest(mem, start_addr, end_addr, &data) {
                        warn!("ohci: ISO payload write failed: {e}");
                        self.unrecoverable("unwritable isochronous payload");
                        return true;
                    }
                    td.set_psw(slot, desc::CC_NOERROR, data.len());
                }
            }
            TokenResult::OutAck => td.set_psw(slot, desc::CC_NOERROR, 0),
            TokenResult::Timeout => td.set_psw(slot, desc::CC_DEVICENOTRESPONDING, 0),
            // Isochronous pipes have no handshake; a refusing endpoint is
            // reported as stalled for this frame's slot.
            TokenResult::Nak | TokenResult::Stall => td.set_psw(slot, desc::CC_STALL, 0),
            TokenResult::Deferred => {
                warn!("ohci: device deferred an isochronous packet");
                return true;
            }
            TokenResult::BadDirection => {
                td.set_psw(slot, desc::CC_UNEXPECTEDPID, 0);
            }
        }

        if relative == frame_count {
            // Last slot serviced; retire the whole TD.
            td.set_condition_code(desc::CC_NOERROR);
            ed.set_head_ptr(td.next_ptr());
            td.next = self.done;
            self.done = addr;
            let di = td.delay_interrupt();
            if di < self.done_count {
                self.done_count = di;
            }
        }
        if let Err(e) = desc::write_iso_td(mem, addr, &td) {
            warn!("ohci: ISO TD writeback failed at {addr:#x}: {e}");
        }
        true
    }
}
