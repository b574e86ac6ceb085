//! Per-device bus state shared by every personality: the assigned address,
//! suspend flag and the endpoint-zero control transfer machine.
//!
//! The controller speaks tokens (SETUP/IN/OUT against an address/endpoint
//! pair); models speak whole control requests and endpoint data. This module
//! is the adapter between the two.

use log::warn;

use crate::snapshot::{restore_model, save_model};
use crate::{AsyncCompletion, ControlResponse, SetupPacket, UsbDeviceModel, UsbSpeed};
use io_snapshot::state::codec::{Decoder, Encoder};
use io_snapshot::state::{
    SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};

/// Device answer to an IN token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbInResult {
    Data(Vec<u8>),
    Nak,
    Stall,
    /// No device answered (bus timeout).
    Timeout,
    /// Deferred; the controller parks the transfer in its pending slot.
    Async,
}

/// Device answer to a SETUP or OUT token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbOutResult {
    Ack,
    Nak,
    Stall,
    Timeout,
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ep0Stage {
    Idle,
    DataIn,
    DataOut,
    StatusIn,
    StatusOut,
    /// Protocol violation or request error; answered with STALL until the
    /// next SETUP.
    Halted,
}

impl Ep0Stage {
    fn to_u8(self) -> u8 {
        match self {
            Ep0Stage::Idle => 0,
            Ep0Stage::DataIn => 1,
            Ep0Stage::DataOut => 2,
            Ep0Stage::StatusIn => 3,
            Ep0Stage::StatusOut => 4,
            Ep0Stage::Halted => 5,
        }
    }

    fn from_u8(v: u8) -> SnapshotResult<Self> {
        Ok(match v {
            0 => Ep0Stage::Idle,
            1 => Ep0Stage::DataIn,
            2 => Ep0Stage::DataOut,
            3 => Ep0Stage::StatusIn,
            4 => Ep0Stage::StatusOut,
            5 => Ep0Stage::Halted,
            _ => return Err(SnapshotError::InvalidFieldEncoding("ep0 stage")),
        })
    }
}

/// Endpoint-zero control transfer state machine.
#[derive(Debug)]
struct Ep0 {
    stage: Ep0Stage,
    setup: SetupPacket,
    /// IN data still to send, or OUT data assembled so far.
    buf: Vec<u8>,
    index: usize,
    /// SET_ADDRESS takes effect only once its status stage completes.
    pending_address: Option<u8>,
}

impl Default for Ep0 {
    fn default() -> Self {
        Self {
            stage: Ep0Stage::Idle,
            setup: SetupPacket::from_bytes([0; 8]),
            buf: Vec::new(),
            index: 0,
            pending_address: None,
        }
    }
}

impl Ep0 {
    fn reset(&mut self) {
        *self = Ep0::default();
    }

    fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new()
            .u8(self.stage.to_u8())
            .bytes(&self.setup.to_bytes())
            .vec_u8(&self.buf)
            .u32(self.index as u32)
            .bool(self.pending_address.is_some());
        enc = enc.u8(self.pending_address.unwrap_or(0));
        enc.finish()
    }

    fn decode(bytes: &[u8]) -> SnapshotResult<Self> {
        let mut d = Decoder::new(bytes);
        let stage = Ep0Stage::from_u8(d.u8()?)?;
        let setup_bytes: [u8; 8] = d
            .bytes(8)?
            .try_into()
            .map_err(|_| SnapshotError::InvalidFieldEncoding("ep0 setup"))?;
        let buf = d.vec_u8()?;
        let index = d.u32()? as usize;
        let has_pending = d.bool()?;
        let pending = d.u8()?;
        d.finish()?;
        if index > buf.len() {
            return Err(SnapshotError::InvalidFieldEncoding("ep0 index"));
        }
        Ok(Self {
            stage,
            setup: SetupPacket::from_bytes(setup_bytes),
            buf,
            index,
            pending_address: has_pending.then_some(pending),
        })
    }
}

/// A device model mounted on a hub port, together with its bus-level state.
pub struct AttachedUsbDevice {
    model: Box<dyn UsbDeviceModel>,
    address: u8,
    suspended: bool,
    ep0: Ep0,
}

const DEVICE_ID: [u8; 4] = *b"USBD";
const VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

const TAG_ADDRESS: u16 = 1;
const TAG_SUSPENDED: u16 = 2;
const TAG_EP0: u16 = 3;
const TAG_MODEL_KIND: u16 = 4;
const TAG_MODEL: u16 = 5;

impl AttachedUsbDevice {
    pub fn new(model: Box<dyn UsbDeviceModel>) -> Self {
        Self {
            model,
            address: 0,
            suspended: false,
            ep0: Ep0::default(),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn speed(&self) -> UsbSpeed {
        self.model.speed()
    }

    pub fn model(&self) -> &dyn UsbDeviceModel {
        &*self.model
    }

    pub fn model_mut(&mut self) -> &mut dyn UsbDeviceModel {
        &mut *self.model
    }

    /// Bus reset: back to the default address with a clean ep0.
    pub fn reset(&mut self) {
        self.address = 0;
        self.suspended = false;
        self.ep0.reset();
        self.model.reset();
        self.model.cancel_async();
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
        self.model.set_suspended(suspended);
        if let Some(hub) = self.model.as_hub_mut() {
            hub.propagate_suspend(suspended);
        }
    }

    pub fn poll_remote_wakeup(&mut self) -> bool {
        if self.model.poll_remote_wakeup() {
            return true;
        }
        match self.model.as_hub_mut() {
            Some(hub) => hub.poll_downstream_wakeup(),
            None => false,
        }
    }

    /// Finds the device answering to `address`, descending through hubs.
    /// This is the broadcast path: hubs are transparent, every enabled
    /// downstream port sees the token and only the addressed function
    /// answers.
    pub fn device_mut_for_address(&mut self, address: u8) -> Option<&mut AttachedUsbDevice> {
        if self.address == address {
            return Some(self);
        }
        self.model.as_hub_mut()?.device_mut_for_address(address)
    }

    pub fn poll_async(&mut self) -> Option<AsyncCompletion> {
        self.model.poll_async_completion()
    }

    pub fn cancel_async(&mut self) {
        self.model.cancel_async();
    }

    /// SETUP token on endpoint zero.
    pub fn handle_setup_token(&mut self, data: &[u8]) -> UsbOutResult {
        let Ok(raw) = <[u8; 8]>::try_from(data) else {
            warn!("usb: SETUP packet with length {}", data.len());
            self.ep0.stage = Ep0Stage::Halted;
            return UsbOutResult::Stall;
        };
        let setup = SetupPacket::from_bytes(raw);
        self.ep0.reset();
        self.ep0.setup = setup;

        // SET_ADDRESS is finalized by the wrapper at the status stage;
        // everything else belongs to the model.
        if setup.bm_request_type == 0x00 && setup.b_request == crate::REQ_SET_ADDRESS {
            self.ep0.pending_address = Some(setup.w_value as u8);
            self.ep0.stage = Ep0Stage::StatusIn;
            return UsbOutResult::Ack;
        }

        if setup.is_device_to_host() {
            match self.model.handle_control_request(&setup, None) {
                ControlResponse::Data(mut d) => {
                    d.truncate(setup.w_length as usize);
                    self.ep0.buf = d;
                    self.ep0.stage = Ep0Stage::DataIn;
                }
                ControlResponse::Ack => {
                    self.ep0.buf = Vec::new();
                    self.ep0.stage = Ep0Stage::DataIn;
                }
                ControlResponse::Stall => self.ep0.stage = Ep0Stage::Halted,
            }
        } else if setup.w_length == 0 {
            match self.model.handle_control_request(&setup, None) {
                ControlResponse::Stall => self.ep0.stage = Ep0Stage::Halted,
                _ => self.ep0.stage = Ep0Stage::StatusIn,
            }
        } else {
            self.ep0.stage = Ep0Stage::DataOut;
        }
        UsbOutResult::Ack
    }

    /// IN token. Endpoint zero runs the control machine; other endpoints go
    /// straight to the model.
    pub fn handle_in_token(&mut self, endpoint: u8, max_len: usize) -> UsbInResult {
        if endpoint != 0 {
            return self.model.handle_data_in(endpoint, max_len);
        }
        match self.ep0.stage {
            Ep0Stage::DataIn => {
                let remaining = self.ep0.buf.len() - self.ep0.index;
                let n = remaining.min(max_len);
                let chunk = self.ep0.buf[self.ep0.index..self.ep0.index + n].to_vec();
                self.ep0.index += n;
                if self.ep0.index >= self.ep0.buf.len() {
                    self.ep0.stage = Ep0Stage::StatusOut;
                }
                UsbInResult::Data(chunk)
            }
            Ep0Stage::StatusIn => {
                self.finish_control();
                UsbInResult::Data(Vec::new())
            }
            Ep0Stage::Halted => UsbInResult::Stall,
            _ => {
                self.ep0.stage = Ep0Stage::Halted;
                UsbInResult::Stall
            }
        }
    }

    /// OUT token.
    pub fn handle_out_token(&mut self, endpoint: u8, data: &[u8]) -> UsbOutResult {
        if endpoint != 0 {
            return self.model.handle_data_out(endpoint, data);
        }
        match self.ep0.stage {
            Ep0Stage::DataOut => {
                self.ep0.buf.extend_from_slice(data);
                if self.ep0.buf.len() >= self.ep0.setup.w_length as usize {
                    let setup = self.ep0.setup;
                    let buf = std::mem::take(&mut self.ep0.buf);
                    match self.model.handle_control_request(&setup, Some(&buf)) {
                        ControlResponse::Stall => self.ep0.stage = Ep0Stage::Halted,
                        _ => self.ep0.stage = Ep0Stage::StatusIn,
                    }
                }
                UsbOutResult::Ack
            }
            Ep0Stage::StatusOut => {
                self.ep0.stage = Ep0Stage::Idle;
                UsbOutResult::Ack
            }
            Ep0Stage::Halted => UsbOutResult::Stall,
            _ => {
                self.ep0.stage = Ep0Stage::Halted;
                UsbOutResult::Stall
            }
        }
    }

    fn finish_control(&mut self) {
        if let Some(addr) = self.ep0.pending_address.take() {
            self.address = addr & 0x7f;
        }
        self.ep0.stage = Ep0Stage::Idle;
    }

    pub fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(DEVICE_ID, VERSION);
        w.field_u8(TAG_ADDRESS, self.address);
        w.field_bool(TAG_SUSPENDED, self.suspended);
        w.field_bytes(TAG_EP0, &self.ep0.encode());
        match save_model(self.model()) {
            Some((kind, blob)) => {
                w.field_u8(TAG_MODEL_KIND, kind as u8);
                w.field_bytes(TAG_MODEL, &blob);
            }
            None => {
                w.field_u8(TAG_MODEL_KIND, 0);
                w.field_bytes(TAG_MODEL, &[]);
            }
        }
        w.finish()
    }

    /// Rebuilds the device (model included) from a snapshot blob.
    pub fn restore(bytes: &[u8]) -> SnapshotResult<Self> {
        let r = SnapshotReader::parse(bytes, DEVICE_ID)?;
        r.ensure_device_major(VERSION.major)?;
        let kind = r
            .u8(TAG_MODEL_KIND)?
            .ok_or(SnapshotError::InvalidFieldEncoding("missing model kind"))?;
        let blob = r.bytes(TAG_MODEL).unwrap_or(&[]);
        let model = restore_model(kind, blob)?;
        let ep0 = match r.bytes(TAG_EP0) {
            Some(b) => Ep0::decode(b)?,
            None => Ep0::default(),
        };
        Ok(Self {
            model,
            address: r.u8(TAG_ADDRESS)?.unwrap_or(0),
            suspended: r.bool(TAG_SUSPENDED)?.unwrap_or(false),
            ep0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ControlResponse, SetupPacket, UsbDeviceModel};
    use std::any::Any;

    struct CannedDevice {
        descriptor: Vec<u8>,
        last_out: Option<(SetupPacket, Vec<u8>)>,
    }

    impl CannedDevice {
        fn new() -> Self {
            Self {
                descriptor: (0u8..18).collect(),
                last_out: None,
            }
        }
    }

    impl UsbDeviceModel for CannedDevice {
        fn reset(&mut self) {}

        fn handle_control_request(
            &mut self,
            setup: &SetupPacket,
            data_stage: Option<&[u8]>,
        ) -> ControlResponse {
            if setup.is_device_to_host() {
                ControlResponse::Data(self.descriptor.clone())
            } else if setup.b_request == 0x42 {
                self.last_out = Some((*setup, data_stage.unwrap_or(&[]).to_vec()));
                ControlResponse::Ack
            } else {
                ControlResponse::Stall
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn setup_bytes(rt: u8, req: u8, value: u16, index: u16, len: u16) -> [u8; 8] {
        SetupPacket {
            bm_request_type: rt,
            b_request: req,
            w_value: value,
            w_index: index,
            w_length: len,
        }
        .to_bytes()
    }

    #[test]
    fn control_in_transfer_runs_all_stages() {
        let mut dev = AttachedUsbDevice::new(Box::new(CannedDevice::new()));
        assert_eq!(
            dev.handle_setup_token(&setup_bytes(0x80, 6, 0x0100, 0, 18)),
            UsbOutResult::Ack
        );
        // Data stage in 8-byte chunks.
        let mut got = Vec::new();
        loop {
            match dev.handle_in_token(0, 8) {
                UsbInResult::Data(d) => {
                    let done = d.len() < 8;
                    got.extend_from_slice(&d);
                    if done || got.len() >= 18 {
                        break;
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(got, (0u8..18).collect::<Vec<_>>());
        // Status stage.
        assert_eq!(dev.handle_out_token(0, &[]), UsbOutResult::Ack);
    }

    #[test]
    fn set_address_applies_at_status_stage() {
        let mut dev = AttachedUsbDevice::new(Box::new(CannedDevice::new()));
        dev.handle_setup_token(&setup_bytes(0x00, 5, 7, 0, 0));
        assert_eq!(dev.address(), 0);
        assert_eq!(dev.handle_in_token(0, 64), UsbInResult::Data(Vec::new()));
        assert_eq!(dev.address(), 7);
    }

    #[test]
    fn control_out_collects_data_stage() {
        let mut dev = AttachedUsbDevice::new(Box::new(CannedDevice::new()));
        dev.handle_setup_token(&setup_bytes(0x00, 0x42, 0, 0, 4));
        assert_eq!(dev.handle_out_token(0, &[1, 2]), UsbOutResult::Ack);
        assert_eq!(dev.handle_out_token(0, &[3, 4]), UsbOutResult::Ack);
        // Status stage is an IN ZLP.
        assert_eq!(dev.handle_in_token(0, 64), UsbInResult::Data(Vec::new()));
        let model = dev.model().as_any().downcast_ref::<CannedDevice>().unwrap();
        let (_, data) = model.last_out.as_ref().unwrap();
        assert_eq!(data, &[1, 2, 3, 4]);
    }

    #[test]
    fn stalled_request_halts_until_next_setup() {
        let mut dev = AttachedUsbDevice::new(Box::new(CannedDevice::new()));
        // Unsupported OUT request with no data stage.
        dev.handle_setup_token(&setup_bytes(0x00, 0x99, 0, 0, 0));
        assert_eq!(dev.handle_in_token(0, 64), UsbInResult::Stall);
        assert_eq!(dev.handle_out_token(0, &[]), UsbOutResult::Stall);
        // A fresh SETUP clears the halt.
        dev.handle_setup_token(&setup_bytes(0x80, 6, 0x0100, 0, 18));
        assert!(matches!(dev.handle_in_token(0, 64), UsbInResult::Data(_)));
    }

    #[test]
    fn out_of_order_token_stalls() {
        let mut dev = AttachedUsbDevice::new(Box::new(CannedDevice::new()));
        assert_eq!(dev.handle_in_token(0, 64), UsbInResult::Stall);
    }

    #[test]
    fn reset_returns_to_default_address() {
        let mut dev = AttachedUsbDevice::new(Box::new(CannedDevice::new()));
        dev.handle_setup_token(&setup_bytes(0x00, 5, 9, 0, 0));
        dev.handle_in_token(0, 64);
        assert_eq!(dev.address(), 9);
        dev.reset();
        assert_eq!(dev.address(), 0);
    }
}
