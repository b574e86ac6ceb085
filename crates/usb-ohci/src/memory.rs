//! Guest physical memory access for controller DMA.
//!
//! The controller never touches host memory directly; every descriptor and
//! payload access goes through [`MemoryBus`]. Implementations are expected to
//! bounds-check and report failures instead of panicking, so a guest pointing
//! a list head at garbage cannot take the emulator down.

use thiserror::Error;

/// Access fell outside the guest RAM an implementation models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest memory access of {len} bytes at {addr:#010x} out of range")]
pub struct MemoryAccessError {
    pub addr: u32,
    pub len: usize,
}

pub trait MemoryBus {
    fn read_physical(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryAccessError>;
    fn write_physical(&mut self, addr: u32, buf: &[u8]) -> Result<(), MemoryAccessError>;

    fn read_u16(&mut self, addr: u32) -> Result<u16, MemoryAccessError> {
        let mut b = [0u8; 2];
        self.read_physical(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), MemoryAccessError> {
        self.write_physical(addr, &value.to_le_bytes())
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, MemoryAccessError> {
        let mut b = [0u8; 4];
        self.read_physical(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), MemoryAccessError> {
        self.write_physical(addr, &value.to_le_bytes())
    }
}

impl<M: MemoryBus + ?Sized> MemoryBus for &mut M {
    fn read_physical(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryAccessError> {
        (**self).read_physical(addr, buf)
    }

    fn write_physical(&mut self, addr: u32, buf: &[u8]) -> Result<(), MemoryAccessError> {
        (**self).write_physical(addr, buf)
    }
}

/// Length of a transfer whose buffer runs from `cbp` to `be` inclusive.
/// The two pointers may sit in different (physically discontiguous) pages.
pub fn buffer_len(cbp: u32, be: u32) -> usize {
    if cbp == 0 || be == 0 {
        return 0;
    }
    if (cbp & !0xfff) != (be & !0xfff) {
        ((be & 0xfff) + 0x1001 - (cbp & 0xfff)) as usize
    } else {
        (be.wrapping_sub(cbp) + 1) as usize
    }
}

/// Reads `buf.len()` payload bytes starting at `cbp`, splitting at the 4 KiB
/// page edge onto the page containing `be`.
pub fn copy_from_guest<M: MemoryBus + ?Sized>(
    mem: &mut M,
    cbp: u32,
    be: u32,
    buf: &mut [u8],
) -> Result<(), MemoryAccessError> {
    let first = ((0x1000 - (cbp & 0xfff)) as usize).min(buf.len());
    mem.read_physical(cbp, &mut buf[..first])?;
    if first < buf.len() {
        mem.read_physical(be & !0xfff, &mut buf[first..])?;
    }
    Ok(())
}

/// Writes payload bytes starting at `cbp` with the same page-split rule.
pub fn copy_to_guest<M: MemoryBus + ?Sized>(
    mem: &mut M,
    cbp: u32,
    be: u32,
    buf: &[u8],
) -> Result<(), MemoryAccessError> {
    let first = ((0x1000 - (cbp & 0xfff)) as usize).min(buf.len());
    mem.write_physical(cbp, &buf[..first])?;
    if first < buf.len() {
        mem.write_physical(be & !0xfff, &buf[first..])?;
    }
    Ok(())
}

/// [`MemoryBus`] adapter that rebases controller-relative addresses onto the
/// machine bus. The offset is the controller's local-memory base.
pub struct OffsetBus<'a, M: MemoryBus + ?Sized> {
    inner: &'a mut M,
    base: u32,
}

impl<'a, M: MemoryBus + ?Sized> OffsetBus<'a, M> {
    pub fn new(inner: &'a mut M, base: u32) -> Self {
        Self { inner, base }
    }
}

impl<M: MemoryBus + ?Sized> MemoryBus for OffsetBus<'_, M> {
    fn read_physical(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryAccessError> {
        self.inner.read_physical(self.base.wrapping_add(addr), buf)
    }

    fn write_physical(&mut self, addr: u32, buf: &[u8]) -> Result<(), MemoryAccessError> {
        self.inner.write_physical(self.base.wrapping_add(addr), buf)
    }
}
