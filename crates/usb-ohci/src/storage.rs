//! Bulk-only mass storage personality with an in-memory disk.
//!
//! Implements the USB mass storage bulk-only transport (CBW in, data phase,
//! CSW out) over a pair of bulk endpoints, and the small SCSI command set a
//! boot-era guest needs. The disk is a plain byte vector in 512-byte
//! sectors.

use std::any::Any;

use log::warn;

use crate::{
    langid_descriptor, string_descriptor, ControlResponse, RequestRecipient, RequestType,
    SetupPacket, UsbDeviceModel, UsbInResult, UsbOutResult,
};
use io_snapshot::state::codec::{Decoder, Encoder};
use io_snapshot::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};

pub const SECTOR_SIZE: usize = 512;

const CBW_SIGNATURE: u32 = 0x4342_5355;
const CSW_SIGNATURE: u32 = 0x5342_5355;
const CBW_LEN: usize = 31;
const CSW_LEN: usize = 13;

const CSW_STATUS_PASSED: u8 = 0;
const CSW_STATUS_FAILED: u8 = 1;
const CSW_STATUS_PHASE_ERROR: u8 = 2;

// Class request codes.
const REQ_BOT_RESET: u8 = 0xff;
const REQ_GET_MAX_LUN: u8 = 0xfe;

// SCSI opcodes.
const SCSI_TEST_UNIT_READY: u8 = 0x00;
const SCSI_REQUEST_SENSE: u8 = 0x03;
const SCSI_INQUIRY: u8 = 0x12;
const SCSI_MODE_SENSE_6: u8 = 0x1a;
const SCSI_READ_CAPACITY_10: u8 = 0x25;
const SCSI_READ_10: u8 = 0x28;
const SCSI_WRITE_10: u8 = 0x2a;

// Sense data (key, additional sense code, qualifier).
const SENSE_NONE: (u8, u8, u8) = (0x00, 0x00, 0x00);
const SENSE_INVALID_OPCODE: (u8, u8, u8) = (0x05, 0x20, 0x00);
const SENSE_LBA_OUT_OF_RANGE: (u8, u8, u8) = (0x05, 0x21, 0x00);

const BULK_IN_ENDPOINT: u8 = 1;
const BULK_OUT_ENDPOINT: u8 = 2;

const DEVICE_DESCRIPTOR: [u8; 18] = [
    18,   // bLength
    0x01, // bDescriptorType: device
    0x10, 0x01, // bcdUSB 1.1
    0x00, // bDeviceClass: per interface
    0x00, // bDeviceSubClass
    0x00, // bDeviceProtocol
    64,   // bMaxPacketSize0
    0x27, 0x06, // idVendor
    0x10, 0x00, // idProduct
    0x00, 0x01, // bcdDevice
    1,    // iManufacturer
    2,    // iProduct
    3,    // iSerialNumber
    1,    // bNumConfigurations
];

const CONFIG_DESCRIPTOR: [u8; 32] = [
    // Configuration descriptor.
    9,    // bLength
    0x02, // bDescriptorType: configuration
    32, 0, // wTotalLength
    1,    // bNumInterfaces
    1,    // bConfigurationValue
    0,    // iConfiguration
    0xc0, // bmAttributes: self powered
    0,    // bMaxPower
    // Interface descriptor.
    9,    // bLength
    0x04, // bDescriptorType: interface
    0,    // bInterfaceNumber
    0,    // bAlternateSetting
    2,    // bNumEndpoints
    0x08, // bInterfaceClass: mass storage
    0x06, // bInterfaceSubClass: SCSI transparent
    0x50, // bInterfaceProtocol: bulk-only
    0,    // iInterface
    // Bulk IN endpoint.
    7,    // bLength
    0x05, // bDescriptorType: endpoint
    0x80 | BULK_IN_ENDPOINT,
    0x02, // bmAttributes: bulk
    64, 0, // wMaxPacketSize
    0,    // bInterval
    // Bulk OUT endpoint.
    7,    // bLength
    0x05, // bDescriptorType: endpoint
    BULK_OUT_ENDPOINT,
    0x02, // bmAttributes: bulk
    64, 0, // wMaxPacketSize
    0,    // bInterval
];

/// Parsed Command Block Wrapper.
#[derive(Debug, Clone, Copy)]
struct Cbw {
    tag: u32,
    transfer_len: u32,
    device_to_host: bool,
    cb: [u8; 16],
    cb_len: usize,
}

impl Cbw {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != CBW_LEN {
            return None;
        }
        let sig = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if sig != CBW_SIGNATURE {
            return None;
        }
        let cb_len = (data[14] & 0x1f) as usize;
        if cb_len == 0 || cb_len > 16 {
            return None;
        }
        let mut cb = [0u8; 16];
        cb.copy_from_slice(&data[15..31]);
        Some(Self {
            tag: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            transfer_len: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            device_to_host: data[12] & 0x80 != 0,
            cb,
            cb_len,
        })
    }
}

/// Bulk-only transport phase.
enum BotPhase {
    /// Waiting for the next CBW on the OUT endpoint.
    Command,
    /// Sending command data to the host, CSW queued behind it.
    DataIn { data: Vec<u8>, index: usize },
    /// Collecting WRITE(10) payload from the host.
    DataOut { lba: u64, expect: usize, buf: Vec<u8> },
    /// Data phase done; CSW pending on the IN endpoint.
    Status,
}

pub struct UsbMassStorage {
    disk: Vec<u8>,
    configuration: u8,
    phase: BotPhase,
    csw: [u8; CSW_LEN],
    sense: (u8, u8, u8),
}

impl UsbMassStorage {
    /// Disk contents are truncated to a whole number of sectors.
    pub fn new(mut disk: Vec<u8>) -> Self {
        disk.truncate(disk.len() / SECTOR_SIZE * SECTOR_SIZE);
        Self {
            disk,
            configuration: 0,
            phase: BotPhase::Command,
            csw: [0; CSW_LEN],
            sense: SENSE_NONE,
        }
    }

    pub fn disk(&self) -> &[u8] {
        &self.disk
    }

    fn num_sectors(&self) -> u64 {
        (self.disk.len() / SECTOR_SIZE) as u64
    }

    fn build_csw(&mut self, tag: u32, residue: u32, status: u8) {
        self.csw[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        self.csw[4..8].copy_from_slice(&tag.to_le_bytes());
        self.csw[8..12].copy_from_slice(&residue.to_le_bytes());
        self.csw[12] = status;
    }

    fn set_sense(&mut self, sense: (u8, u8, u8)) {
        self.sense = sense;
    }

    /// Runs a freshly parsed CBW. Decides the data phase and queues the CSW.
    fn execute_cbw(&mut self, cbw: Cbw) {
        let opcode = cbw.cb[0];
        let result = match opcode {
            SCSI_TEST_UNIT_READY => Ok(Vec::new()),
            SCSI_REQUEST_SENSE => Ok(self.sense_data()),
            SCSI_INQUIRY => Ok(Self::inquiry_data()),
            SCSI_MODE_SENSE_6 => Ok(vec![3, 0, 0, 0]),
            SCSI_READ_CAPACITY_10 => Ok(self.read_capacity_data()),
            SCSI_READ_10 => self.scsi_read_10(&cbw),
            SCSI_WRITE_10 => {
                match self.scsi_write_10_start(&cbw) {
                    Ok(()) => return, // phase switched to DataOut
                    Err(sense) => Err(sense),
                }
            }
            _ => {
                warn!("usb-msd: unsupported SCSI opcode {opcode:#04x}");
                Err(SENSE_INVALID_OPCODE)
            }
        };

        match result {
            Ok(mut data) => {
                if opcode != SCSI_REQUEST_SENSE {
                    self.set_sense(SENSE_NONE);
                }
                let expected = cbw.transfer_len as usize;
                if !cbw.device_to_host && !data.is_empty() {
                    // Device wants to send but the host asked for none.
                    self.build_csw(cbw.tag, cbw.transfer_len, CSW_STATUS_PHASE_ERROR);
                    self.phase = BotPhase::Status;
                    return;
                }
                data.truncate(expected);
                let residue = (expected - data.len()) as u32;
                self.build_csw(cbw.tag, residue, CSW_STATUS_PASSED);
                self.phase = if data.is_empty() {
                    BotPhase::Status
                } else {
                    BotPhase::DataIn { data, index: 0 }
                };
            }
            Err(sense) => {
                self.set_sense(sense);
                self.build_csw(cbw.tag, cbw.transfer_len, CSW_STATUS_FAILED);
                self.phase = BotPhase::Status;
            }
        }
    }

    fn inquiry_data() -> Vec<u8> {
        let mut d = vec![0u8; 36];
        d[0] = 0x00; // direct access block device
        d[1] = 0x80; // removable
        d[2] = 0x02; // ANSI SCSI-2
        d[3] = 0x02; // response data format
        d[4] = 31; // additional length
        d[8..16].copy_from_slice(b"EMULATED");
        d[16..32].copy_from_slice(b"USB DISK        ");
        d[32..36].copy_from_slice(b"1.0 ");
        d
    }

    fn sense_data(&mut self) -> Vec<u8> {
        let (key, asc, ascq) = self.sense;
        let mut d = vec![0u8; 18];
        d[0] = 0x70; // current error, fixed format
        d[2] = key;
        d[7] = 10; // additional sense length
        d[12] = asc;
        d[13] = ascq;
        self.sense = SENSE_NONE;
        d
    }

    fn read_capacity_data(&self) -> Vec<u8> {
        let last_lba = self.num_sectors().saturating_sub(1) as u32;
        let mut d = Vec::with_capacity(8);
        d.extend_from_slice(&last_lba.to_be_bytes());
        d.extend_from_slice(&(SECTOR_SIZE as u32).to_be_bytes());
        d
    }

    fn rw10_range(&self, cb: &[u8; 16]) -> Result<(u64, usize), (u8, u8, u8)> {
        let lba = u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]) as u64;
        let count = u16::from_be_bytes([cb[7], cb[8]]) as u64;
        if lba + count > self.num_sectors() {
            return Err(SENSE_LBA_OUT_OF_RANGE);
        }
        Ok((lba, (count as usize) * SECTOR_SIZE))
    }

    fn scsi_read_10(&mut self, cbw: &Cbw) -> Result<Vec<u8>, (u8, u8, u8)> {
        let (lba, len) = self.rw10_range(&cbw.cb)?;
        let start = lba as usize * SECTOR_SIZE;
        Ok(self.disk[start..start + len].to_vec())
    }

    fn scsi_write_10_start(&mut self, cbw: &Cbw) -> Result<(), (u8, u8, u8)> {
        let (lba, len) = self.rw10_range(&cbw.cb)?;
        if cbw.device_to_host || (cbw.transfer_len as usize) < len {
            return Err(SENSE_LBA_OUT_OF_RANGE);
        }
        if len == 0 {
            self.build_csw(cbw.tag, cbw.transfer_len, CSW_STATUS_PASSED);
            self.phase = BotPhase::Status;
            return Ok(());
        }
        self.build_csw(cbw.tag, cbw.transfer_len - len as u32, CSW_STATUS_PASSED);
        self.phase = BotPhase::DataOut {
            lba,
            expect: len,
            buf: Vec::with_capacity(len),
        };
        Ok(())
    }
}

impl UsbDeviceModel for UsbMassStorage {
    fn reset(&mut self) {
        self.configuration = 0;
        self.phase = BotPhase::Command;
        self.sense = SENSE_NONE;
    }

    fn handle_control_request(
        &mut self,
        setup: &SetupPacket,
        _data_stage: Option<&[u8]>,
    ) -> ControlResponse {
        match (setup.request_type(), setup.recipient()) {
            (RequestType::Standard, RequestRecipient::Device) => match setup.b_request {
                crate::REQ_GET_DESCRIPTOR => match setup.descriptor_type() {
                    crate::DESC_DEVICE => {
                        ControlResponse::data_clamped(DEVICE_DESCRIPTOR.to_vec(), setup.w_length)
                    }
                    crate::DESC_CONFIGURATION => {
                        ControlResponse::data_clamped(CONFIG_DESCRIPTOR.to_vec(), setup.w_length)
                    }
                    crate::DESC_STRING => match setup.descriptor_index() {
                        0 => ControlResponse::data_clamped(langid_descriptor(), setup.w_length),
                        1 => ControlResponse::data_clamped(
                            string_descriptor("Emulated"),
                            setup.w_length,
                        ),
                        2 => ControlResponse::data_clamped(
                            string_descriptor("USB Disk"),
                            setup.w_length,
                        ),
                        3 => ControlResponse::data_clamped(
                            string_descriptor("000000000001"),
                            setup.w_length,
                        ),
                        _ => ControlResponse::Stall,
                    },
                    _ => ControlResponse::Stall,
                },
                crate::REQ_SET_CONFIGURATION => {
                    self.configuration = setup.w_value as u8;
                    ControlResponse::Ack
                }
                crate::REQ_GET_CONFIGURATION => ControlResponse::Data(vec![self.configuration]),
                crate::REQ_GET_STATUS => {
                    ControlResponse::data_clamped(vec![0x01, 0x00], setup.w_length)
                }
                _ => ControlResponse::Stall,
            },
            (RequestType::Standard, RequestRecipient::Interface) => match setup.b_request {
                crate::REQ_GET_INTERFACE => ControlResponse::Data(vec![0]),
                crate::REQ_SET_INTERFACE if setup.w_value == 0 => ControlResponse::Ack,
                _ => ControlResponse::Stall,
            },
            (RequestType::Standard, RequestRecipient::Endpoint)
                if setup.b_request == crate::REQ_CLEAR_FEATURE =>
            {
                // CLEAR_FEATURE(ENDPOINT_HALT), part of BOT error recovery.
                ControlResponse::Ack
            }
            (RequestType::Class, RequestRecipient::Interface) => match setup.b_request {
                REQ_BOT_RESET => {
                    self.phase = BotPhase::Command;
                    ControlResponse::Ack
                }
                REQ_GET_MAX_LUN => ControlResponse::Data(vec![0]),
                _ => ControlResponse::Stall,
            },
            _ => ControlResponse::Stall,
        }
    }

    fn handle_data_in(&mut self, endpoint: u8, max_len: usize) -> UsbInResult {
        if endpoint != BULK_IN_ENDPOINT {
            return UsbInResult::Stall;
        }
        match &mut self.phase {
            BotPhase::DataIn { data, index } => {
                let n = (data.len() - *index).min(max_len);
                let chunk = data[*index..*index + n].to_vec();
                *index += n;
                if *index >= data.len() {
                    self.phase = BotPhase::Status;
                }
                UsbInResult::Data(chunk)
            }
            BotPhase::Status => {
                let mut csw = self.csw.to_vec();
                csw.truncate(max_len);
                self.phase = BotPhase::Command;
                UsbInResult::Data(csw)
            }
            // No data to give while waiting for a command.
            BotPhase::Command | BotPhase::DataOut { .. } => UsbInResult::Nak,
        }
    }

    fn handle_data_out(&mut self, endpoint: u8, data: &[u8]) -> UsbOutResult {
        if endpoint != BULK_OUT_ENDPOINT {
            return UsbOutResult::Stall;
        }
        match &mut self.phase {
            BotPhase::Command => match Cbw::parse(data) {
                Some(cbw) => {
                    self.execute_cbw(cbw);
                    UsbOutResult::Ack
                }
                None => {
                    warn!("usb-msd: malformed CBW ({} bytes)", data.len());
                    UsbOutResult::Stall
                }
            },
            BotPhase::DataOut { lba, expect, buf } => {
                buf.extend_from_slice(data);
                if buf.len() >= *expect {
                    buf.truncate(*expect);
                    let start = *lba as usize * SECTOR_SIZE;
                    self.disk[start..start + *expect].copy_from_slice(buf);
                    self.set_sense(SENSE_NONE);
                    self.phase = BotPhase::Status;
                }
                UsbOutResult::Ack
            }
            // OUT during an IN phase is a protocol violation.
            BotPhase::DataIn { .. } | BotPhase::Status => UsbOutResult::Stall,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

const TAG_DISK: u16 = 1;
const TAG_CONFIGURATION: u16 = 2;
const TAG_PHASE: u16 = 3;
const TAG_CSW: u16 = 4;
const TAG_SENSE: u16 = 5;

impl IoSnapshot for UsbMassStorage {
    const DEVICE_ID: [u8; 4] = *b"UMSD";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_bytes(TAG_DISK, &self.disk);
        w.field_u8(TAG_CONFIGURATION, self.configuration);
        let phase = match &self.phase {
            BotPhase::Command => Encoder::new().u8(0),
            BotPhase::DataIn { data, index } => {
                Encoder::new().u8(1).vec_u8(data).u32(*index as u32)
            }
            BotPhase::DataOut { lba, expect, buf } => Encoder::new()
                .u8(2)
                .u64(*lba)
                .u32(*expect as u32)
                .vec_u8(buf),
            BotPhase::Status => Encoder::new().u8(3),
        };
        w.field_bytes(TAG_PHASE, &phase.finish());
        w.field_bytes(TAG_CSW, &self.csw);
        let (key, asc, ascq) = self.sense;
        w.field_bytes(TAG_SENSE, &[key, asc, ascq]);
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;
        let disk = r
            .bytes(TAG_DISK)
            .ok_or(SnapshotError::InvalidFieldEncoding("missing disk"))?
            .to_vec();
        let phase = match r.bytes(TAG_PHASE) {
            Some(blob) => {
                let mut d = Decoder::new(blob);
                let phase = match d.u8()? {
                    0 => BotPhase::Command,
                    1 => {
                        let data = d.vec_u8()?;
                        let index = d.u32()? as usize;
                        if index > data.len() {
                            return Err(SnapshotError::InvalidFieldEncoding("data-in index"));
                        }
                        BotPhase::DataIn { data, index }
                    }
                    2 => {
                        let lba = d.u64()?;
                        let expect = d.u32()? as usize;
                        let buf = d.vec_u8()?;
                        let end = (lba as usize)
                            .checked_mul(SECTOR_SIZE)
                            .and_then(|s| s.checked_add(expect));
                        if end.map_or(true, |e| e > disk.len()) {
                            return Err(SnapshotError::InvalidFieldEncoding("data-out range"));
                        }
                        BotPhase::DataOut { lba, expect, buf }
                    }
                    3 => BotPhase::Status,
                    _ => return Err(SnapshotError::InvalidFieldEncoding("transport phase")),
                };
                d.finish()?;
                phase
            }
            None => BotPhase::Command,
        };
        let mut csw = [0u8; CSW_LEN];
        if let Some(b) = r.bytes(TAG_CSW) {
            if b.len() != CSW_LEN {
                return Err(SnapshotError::InvalidFieldEncoding("csw length"));
            }
            csw.copy_from_slice(b);
        }
        let sense = match r.bytes(TAG_SENSE) {
            Some([key, asc, ascq]) => (*key, *asc, *ascq),
            Some(_) => return Err(SnapshotError::InvalidFieldEncoding("sense length")),
            None => SENSE_NONE,
        };
        self.disk = disk;
        self.configuration = r.u8(TAG_CONFIGURATION)?.unwrap_or(0);
        self.phase = phase;
        self.csw = csw;
        self.sense = sense;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_with_pattern(sectors: usize) -> Vec<u8> {
        let mut d = vec![0u8; sectors * SECTOR_SIZE];
        for (i, b) in d.iter_mut().enumerate() {
            *b = (i / SECTOR_SIZE) as u8;
        }
        d
    }

    fn cbw(tag: u32, transfer_len: u32, to_host: bool, cb: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(CBW_LEN);
        out.extend_from_slice(&CBW_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&transfer_len.to_le_bytes());
        out.push(if to_host { 0x80 } else { 0x00 });
        out.push(0); // LUN
        out.push(cb.len() as u8);
        let mut block = [0u8; 16];
        block[..cb.len()].copy_from_slice(cb);
        out.extend_from_slice(&block);
        out
    }

    fn drain_in(dev: &mut UsbMassStorage, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            match dev.handle_data_in(BULK_IN_ENDPOINT, 64) {
                UsbInResult::Data(d) => out.extend_from_slice(&d),
                other => panic!("unexpected {other:?}"),
            }
        }
        out
    }

    fn expect_csw(dev: &mut UsbMassStorage, tag: u32, status: u8) -> u32 {
        let UsbInResult::Data(csw) = dev.handle_data_in(BULK_IN_ENDPOINT, 64) else {
            panic!("expected CSW");
        };
        assert_eq!(csw.len(), CSW_LEN);
        assert_eq!(&csw[0..4], &CSW_SIGNATURE.to_le_bytes());
        assert_eq!(u32::from_le_bytes([csw[4], csw[5], csw[6], csw[7]]), tag);
        assert_eq!(csw[12], status);
        u32::from_le_bytes([csw[8], csw[9], csw[10], csw[11]])
    }

    #[test]
    fn inquiry_then_csw() {
        let mut dev = UsbMassStorage::new(disk_with_pattern(8));
        let cmd = cbw(0x1001, 36, true, &[SCSI_INQUIRY, 0, 0, 0, 36, 0]);
        assert_eq!(
            dev.handle_data_out(BULK_OUT_ENDPOINT, &cmd),
            UsbOutResult::Ack
        );
        let data = drain_in(&mut dev, 36);
        assert_eq!(data[0], 0x00);
        assert_eq!(&data[8..16], b"EMULATED");
        assert_eq!(expect_csw(&mut dev, 0x1001, CSW_STATUS_PASSED), 0);
    }

    #[test]
    fn read_10_returns_sector_data() {
        let mut dev = UsbMassStorage::new(disk_with_pattern(8));
        // Read 2 sectors starting at LBA 3.
        let cb = [SCSI_READ_10, 0, 0, 0, 0, 3, 0, 0, 2, 0];
        let cmd = cbw(0x2002, 2 * SECTOR_SIZE as u32, true, &cb);
        dev.handle_data_out(BULK_OUT_ENDPOINT, &cmd);
        let data = drain_in(&mut dev, 2 * SECTOR_SIZE);
        assert!(data[..SECTOR_SIZE].iter().all(|&b| b == 3));
        assert!(data[SECTOR_SIZE..].iter().all(|&b| b == 4));
        assert_eq!(expect_csw(&mut dev, 0x2002, CSW_STATUS_PASSED), 0);
    }

    #[test]
    fn write_10_commits_after_data_phase() {
        let mut dev = UsbMassStorage::new(disk_with_pattern(8));
        let cb = [SCSI_WRITE_10, 0, 0, 0, 0, 5, 0, 0, 1, 0];
        let cmd = cbw(0x3003, SECTOR_SIZE as u32, false, &cb);
        dev.handle_data_out(BULK_OUT_ENDPOINT, &cmd);
        // Payload arrives in bulk-packet chunks.
        let payload = vec![0xaa; SECTOR_SIZE];
        for chunk in payload.chunks(64) {
            assert_eq!(
                dev.handle_data_out(BULK_OUT_ENDPOINT, chunk),
                UsbOutResult::Ack
            );
        }
        assert_eq!(expect_csw(&mut dev, 0x3003, CSW_STATUS_PASSED), 0);
        let start = 5 * SECTOR_SIZE;
        assert!(dev.disk()[start..start + SECTOR_SIZE].iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn read_capacity_reports_last_lba() {
        let mut dev = UsbMassStorage::new(disk_with_pattern(8));
        let cmd = cbw(0x4004, 8, true, &[SCSI_READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        dev.handle_data_out(BULK_OUT_ENDPOINT, &cmd);
        let data = drain_in(&mut dev, 8);
        assert_eq!(u32::from_be_bytes([data[0], data[1], data[2], data[3]]), 7);
        assert_eq!(
            u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            SECTOR_SIZE as u32
        );
        expect_csw(&mut dev, 0x4004, CSW_STATUS_PASSED);
    }

    #[test]
    fn out_of_range_read_fails_with_sense() {
        let mut dev = UsbMassStorage::new(disk_with_pattern(4));
        let cb = [SCSI_READ_10, 0, 0, 0, 0, 10, 0, 0, 1, 0];
        let cmd = cbw(0x5005, SECTOR_SIZE as u32, true, &cb);
        dev.handle_data_out(BULK_OUT_ENDPOINT, &cmd);
        assert_eq!(
            expect_csw(&mut dev, 0x5005, CSW_STATUS_FAILED),
            SECTOR_SIZE as u32
        );
        // REQUEST SENSE reports the failure, then clears it.
        let cmd = cbw(0x5006, 18, true, &[SCSI_REQUEST_SENSE, 0, 0, 0, 18, 0]);
        dev.handle_data_out(BULK_OUT_ENDPOINT, &cmd);
        let sense = drain_in(&mut dev, 18);
        assert_eq!(sense[2], 0x05);
        assert_eq!(sense[12], 0x21);
        expect_csw(&mut dev, 0x5006, CSW_STATUS_PASSED);
    }

    #[test]
    fn unknown_opcode_fails() {
        let mut dev = UsbMassStorage::new(disk_with_pattern(4));
        let cmd = cbw(0x6006, 0, false, &[0xee, 0, 0, 0, 0, 0]);
        dev.handle_data_out(BULK_OUT_ENDPOINT, &cmd);
        expect_csw(&mut dev, 0x6006, CSW_STATUS_FAILED);
        assert_eq!(dev.sense, SENSE_INVALID_OPCODE);
    }

    #[test]
    fn malformed_cbw_stalls() {
        let mut dev = UsbMassStorage::new(disk_with_pattern(4));
        assert_eq!(
            dev.handle_data_out(BULK_OUT_ENDPOINT, &[0u8; 10]),
            UsbOutResult::Stall
        );
        let mut bad = cbw(1, 0, false, &[SCSI_TEST_UNIT_READY]);
        bad[0] = 0;
        assert_eq!(
            dev.handle_data_out(BULK_OUT_ENDPOINT, &bad),
            UsbOutResult::Stall
        );
    }

    #[test]
    fn bulk_in_naks_while_waiting_for_command() {
        let mut dev = UsbMassStorage::new(disk_with_pattern(4));
        assert_eq!(dev.handle_data_in(BULK_IN_ENDPOINT, 64), UsbInResult::Nak);
    }

    #[test]
    fn get_max_lun_and_bot_reset() {
        let mut dev = UsbMassStorage::new(disk_with_pattern(4));
        let get = SetupPacket {
            bm_request_type: 0xa1,
            b_request: REQ_GET_MAX_LUN,
            w_value: 0,
            w_index: 0,
            w_length: 1,
        };
        assert_eq!(
            dev.handle_control_request(&get, None),
            ControlResponse::Data(vec![0])
        );
        // Mid-transfer reset returns the transport to the command phase.
        let cb = [SCSI_READ_10, 0, 0, 0, 0, 0, 0, 0, 1, 0];
        dev.handle_data_out(BULK_OUT_ENDPOINT, &cbw(7, SECTOR_SIZE as u32, true, &cb));
        let reset = SetupPacket {
            bm_request_type: 0x21,
            b_request: REQ_BOT_RESET,
            w_value: 0,
            w_index: 0,
            w_length: 0,
        };
        assert_eq!(dev.handle_control_request(&reset, None), ControlResponse::Ack);
        assert_eq!(dev.handle_data_in(BULK_IN_ENDPOINT, 64), UsbInResult::Nak);
    }

    #[test]
    fn snapshot_round_trip_preserves_disk_and_phase() {
        let mut dev = UsbMassStorage::new(disk_with_pattern(4));
        let cb = [SCSI_READ_10, 0, 0, 0, 0, 1, 0, 0, 1, 0];
        dev.handle_data_out(BULK_OUT_ENDPOINT, &cbw(9, SECTOR_SIZE as u32, true, &cb));
        let blob = dev.save_state();

        let mut restored = UsbMassStorage::new(Vec::new());
        restored.load_state(&blob).unwrap();
        assert_eq!(restored.disk(), dev.disk());
        // The in-flight read continues after restore.
        let data = drain_in(&mut restored, SECTOR_SIZE);
        assert!(data.iter().all(|&b| b == 1));
        expect_csw(&mut restored, 9, CSW_STATUS_PASSED);
    }
}
