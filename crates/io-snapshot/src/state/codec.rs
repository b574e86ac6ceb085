//! Plain little-endian encoder/decoder for nested snapshot payloads.
//!
//! Field payloads that hold structured sub-state (a port array, a queue of
//! reports) use these instead of inventing per-device framing. [`Encoder`] is
//! a chained builder; [`Decoder`] consumes in the same order and `finish`
//! rejects trailing bytes.

use super::{SnapshotError, SnapshotResult};

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bool(self, v: bool) -> Self {
        self.u8(u8::from(v))
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.buf.push(v);
        self
    }

    pub fn u16(mut self, v: u16) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Raw bytes without a length prefix. The decoder must know the size.
    pub fn bytes(mut self, b: &[u8]) -> Self {
        self.buf.extend_from_slice(b);
        self
    }

    /// Length-prefixed byte string.
    pub fn vec_u8(mut self, b: &[u8]) -> Self {
        self = self.u32(b.len() as u32);
        self.bytes(b)
    }

    /// Count-prefixed sequence of length-prefixed byte strings.
    pub fn vec_bytes(mut self, items: &[Vec<u8>]) -> Self {
        self = self.u32(items.len() as u32);
        for item in items {
            self = self.vec_u8(item);
        }
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> SnapshotResult<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(SnapshotError::Truncated);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn bool(&mut self) -> SnapshotResult<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn u8(&mut self) -> SnapshotResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> SnapshotResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> SnapshotResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> SnapshotResult<u64> {
        let b = self.take(8)?;
        let arr: [u8; 8] = b.try_into().map_err(|_| SnapshotError::Truncated)?;
        Ok(u64::from_le_bytes(arr))
    }

    pub fn bytes(&mut self, len: usize) -> SnapshotResult<&'a [u8]> {
        self.take(len)
    }

    pub fn vec_u8(&mut self) -> SnapshotResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn vec_bytes(&mut self) -> SnapshotResult<Vec<Vec<u8>>> {
        let count = self.u32()? as usize;
        // Each entry costs at least its 4-byte length prefix.
        if self.data.len() - self.pos < count.saturating_mul(4) {
            return Err(SnapshotError::Truncated);
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.vec_u8()?);
        }
        Ok(out)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn finish(self) -> SnapshotResult<()> {
        if self.pos != self.data.len() {
            return Err(SnapshotError::InvalidFieldEncoding("trailing bytes"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalars_and_vecs() {
        let blob = Encoder::new()
            .bool(true)
            .u8(7)
            .u16(0x1234)
            .u32(0xdead_beef)
            .u64(0x0102_0304_0506_0708)
            .vec_u8(b"abc")
            .vec_bytes(&[vec![1], vec![], vec![2, 3]])
            .finish();

        let mut d = Decoder::new(&blob);
        assert!(d.bool().unwrap());
        assert_eq!(d.u8().unwrap(), 7);
        assert_eq!(d.u16().unwrap(), 0x1234);
        assert_eq!(d.u32().unwrap(), 0xdead_beef);
        assert_eq!(d.u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(d.vec_u8().unwrap(), b"abc");
        assert_eq!(d.vec_bytes().unwrap(), vec![vec![1], vec![], vec![2, 3]]);
        d.finish().unwrap();
    }

    #[test]
    fn finish_rejects_trailing_bytes() {
        let blob = Encoder::new().u16(1).finish();
        let mut d = Decoder::new(&blob);
        let _ = d.u8().unwrap();
        assert!(d.finish().is_err());
    }

    #[test]
    fn truncated_read_errors() {
        let blob = Encoder::new().u8(1).finish();
        let mut d = Decoder::new(&blob);
        assert_eq!(d.u32(), Err(SnapshotError::Truncated));
    }

    #[test]
    fn hostile_vec_count_does_not_allocate() {
        // A forged count larger than the payload must fail fast.
        let blob = Encoder::new().u32(u32::MAX).finish();
        let mut d = Decoder::new(&blob);
        assert_eq!(d.vec_bytes(), Err(SnapshotError::Truncated));
    }
}
