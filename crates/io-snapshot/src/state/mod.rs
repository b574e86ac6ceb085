//! Snapshot header, field table and the [`IoSnapshot`] trait.
//!
//! Layout of a snapshot blob:
//!
//! ```text
//! magic    [u8; 4]   b"IOSN"
//! device   [u8; 4]   per-device identifier, stable across releases
//! major    u16 LE
//! minor    u16 LE
//! fields   *         repeated { tag: u16 LE, len: u32 LE, payload: [u8; len] }
//! ```
//!
//! Field tags are private to each device. A loader must tolerate tags it does
//! not know (they are newer-minor additions) and missing tags it does know
//! (older-minor snapshots), falling back to reset defaults for the latter.

pub mod codec;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot header magic mismatch")]
    BadMagic,
    #[error("snapshot is for device {found:?}, expected {expected:?}")]
    DeviceIdMismatch { expected: [u8; 4], found: [u8; 4] },
    #[error("snapshot major version {found} not supported (want {expected})")]
    UnsupportedVersion { expected: u16, found: u16 },
    #[error("snapshot truncated")]
    Truncated,
    #[error("invalid field encoding: {0}")]
    InvalidFieldEncoding(&'static str),
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

/// Devices that can be saved into and restored from a snapshot blob.
///
/// `load_state` must either fully apply the snapshot or leave the device in a
/// consistent (reset-equivalent) state; partial application is not allowed to
/// leak out as success.
pub trait IoSnapshot {
    /// Stable identifier for this device's snapshot blobs.
    const DEVICE_ID: [u8; 4];
    /// Bump minor for additive fields, major for incompatible reshapes.
    const DEVICE_VERSION: SnapshotVersion;

    fn save_state(&self) -> Vec<u8>;
    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()>;
}

const MAGIC: [u8; 4] = *b"IOSN";
const HEADER_LEN: usize = 12;

/// Builds a snapshot blob field by field.
pub struct SnapshotWriter {
    buf: Vec<u8>,
}

impl SnapshotWriter {
    pub fn new(device_id: [u8; 4], version: SnapshotVersion) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&device_id);
        buf.extend_from_slice(&version.major.to_le_bytes());
        buf.extend_from_slice(&version.minor.to_le_bytes());
        Self { buf }
    }

    pub fn field_bytes(&mut self, tag: u16, payload: &[u8]) {
        self.buf.extend_from_slice(&tag.to_le_bytes());
        self.buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(payload);
    }

    pub fn field_bool(&mut self, tag: u16, v: bool) {
        self.field_bytes(tag, &[u8::from(v)]);
    }

    pub fn field_u8(&mut self, tag: u16, v: u8) {
        self.field_bytes(tag, &[v]);
    }

    pub fn field_u16(&mut self, tag: u16, v: u16) {
        self.field_bytes(tag, &v.to_le_bytes());
    }

    pub fn field_u32(&mut self, tag: u16, v: u32) {
        self.field_bytes(tag, &v.to_le_bytes());
    }

    pub fn field_u64(&mut self, tag: u16, v: u64) {
        self.field_bytes(tag, &v.to_le_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Parsed view over a snapshot blob. Borrows the input.
pub struct SnapshotReader<'a> {
    version: SnapshotVersion,
    fields: Vec<(u16, &'a [u8])>,
}

impl<'a> SnapshotReader<'a> {
    /// Validates the header against `device_id` and indexes the field table.
    pub fn parse(bytes: &'a [u8], device_id: [u8; 4]) -> SnapshotResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(SnapshotError::Truncated);
        }
        if bytes[0..4] != MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let found: [u8; 4] = bytes[4..8].try_into().unwrap_or_default();
        if found != device_id {
            return Err(SnapshotError::DeviceIdMismatch {
                expected: device_id,
                found,
            });
        }
        let major = u16::from_le_bytes([bytes[8], bytes[9]]);
        let minor = u16::from_le_bytes([bytes[10], bytes[11]]);

        let mut fields = Vec::new();
        let mut pos = HEADER_LEN;
        while pos < bytes.len() {
            if bytes.len() - pos < 6 {
                return Err(SnapshotError::Truncated);
            }
            let tag = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
            let len = u32::from_le_bytes([
                bytes[pos + 2],
                bytes[pos + 3],
                bytes[pos + 4],
                bytes[pos + 5],
            ]) as usize;
            pos += 6;
            if bytes.len() - pos < len {
                return Err(SnapshotError::Truncated);
            }
            fields.push((tag, &bytes[pos..pos + len]));
            pos += len;
        }
        Ok(Self {
            version: SnapshotVersion::new(major, minor),
            fields,
        })
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    /// Fails when the stored major version differs from what the device
    /// understands. Minor differences are handled by tag tolerance.
    pub fn ensure_device_major(&self, major: u16) -> SnapshotResult<()> {
        if self.version.major != major {
            return Err(SnapshotError::UnsupportedVersion {
                expected: major,
                found: self.version.major,
            });
        }
        Ok(())
    }

    /// Raw payload of `tag`, or `None` if the snapshot does not carry it.
    /// The last occurrence wins if a tag repeats.
    pub fn bytes(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields
            .iter()
            .rev()
            .find(|(t, _)| *t == tag)
            .map(|(_, p)| *p)
    }

    pub fn bool(&self, tag: u16) -> SnapshotResult<Option<bool>> {
        Ok(self.u8(tag)?.map(|v| v != 0))
    }

    pub fn u8(&self, tag: u16) -> SnapshotResult<Option<u8>> {
        match self.bytes(tag) {
            None => Ok(None),
            Some([v]) => Ok(Some(*v)),
            Some(_) => Err(SnapshotError::InvalidFieldEncoding("u8 field size")),
        }
    }

    pub fn u16(&self, tag: u16) -> SnapshotResult<Option<u16>> {
        match self.bytes(tag) {
            None => Ok(None),
            Some(p) => {
                let arr: [u8; 2] = p
                    .try_into()
                    .map_err(|_| SnapshotError::InvalidFieldEncoding("u16 field size"))?;
                Ok(Some(u16::from_le_bytes(arr)))
            }
        }
    }

    pub fn u32(&self, tag: u16) -> SnapshotResult<Option<u32>> {
        match self.bytes(tag) {
            None => Ok(None),
            Some(p) => {
                let arr: [u8; 4] = p
                    .try_into()
                    .map_err(|_| SnapshotError::InvalidFieldEncoding("u32 field size"))?;
                Ok(Some(u32::from_le_bytes(arr)))
            }
        }
    }

    pub fn u64(&self, tag: u16) -> SnapshotResult<Option<u64>> {
        match self.bytes(tag) {
            None => Ok(None),
            Some(p) => {
                let arr: [u8; 8] = p
                    .try_into()
                    .map_err(|_| SnapshotError::InvalidFieldEncoding("u64 field size"))?;
                Ok(Some(u64::from_le_bytes(arr)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: [u8; 4] = *b"TSTD";
    const V: SnapshotVersion = SnapshotVersion::new(1, 0);

    #[test]
    fn writes_and_reads_fields() {
        let mut w = SnapshotWriter::new(ID, V);
        w.field_u8(1, 0xab);
        w.field_u32(2, 0xdead_beef);
        w.field_bool(3, true);
        w.field_bytes(4, b"hello");
        let blob = w.finish();

        let r = SnapshotReader::parse(&blob, ID).unwrap();
        r.ensure_device_major(1).unwrap();
        assert_eq!(r.u8(1).unwrap(), Some(0xab));
        assert_eq!(r.u32(2).unwrap(), Some(0xdead_beef));
        assert_eq!(r.bool(3).unwrap(), Some(true));
        assert_eq!(r.bytes(4), Some(&b"hello"[..]));
        assert_eq!(r.u32(99).unwrap(), None);
    }

    #[test]
    fn rejects_wrong_device() {
        let blob = SnapshotWriter::new(ID, V).finish();
        assert!(matches!(
            SnapshotReader::parse(&blob, *b"OTHR"),
            Err(SnapshotError::DeviceIdMismatch { .. })
        ));
    }

    #[test]
    fn rejects_wrong_major() {
        let blob = SnapshotWriter::new(ID, SnapshotVersion::new(2, 0)).finish();
        let r = SnapshotReader::parse(&blob, ID).unwrap();
        assert!(matches!(
            r.ensure_device_major(1),
            Err(SnapshotError::UnsupportedVersion {
                expected: 1,
                found: 2
            })
        ));
    }

    #[test]
    fn rejects_truncated_field() {
        let mut w = SnapshotWriter::new(ID, V);
        w.field_u32(1, 7);
        let mut blob = w.finish();
        blob.truncate(blob.len() - 1);
        assert_eq!(
            SnapshotReader::parse(&blob, ID).err(),
            Some(SnapshotError::Truncated)
        );
    }

    #[test]
    fn wrong_size_scalar_is_an_error() {
        let mut w = SnapshotWriter::new(ID, V);
        w.field_bytes(1, &[1, 2, 3]);
        let blob = w.finish();
        let r = SnapshotReader::parse(&blob, ID).unwrap();
        assert!(r.u32(1).is_err());
    }
}
