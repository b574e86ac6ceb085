//! USB 1.1 OHCI host controller emulation.
//!
//! [`ohci::OhciController`] implements the operational register file and the
//! descriptor-based DMA engine: it walks guest-resident endpoint and transfer
//! descriptor lists each frame, runs the transactions against emulated USB
//! devices hanging off the root hub, and retires completed descriptors onto
//! the done queue.
//!
//! Device models implement [`UsbDeviceModel`] and are mounted on a root hub
//! port (optionally behind an emulated external hub) wrapped in
//! [`device::AttachedUsbDevice`], which owns the bus address and the shared
//! endpoint-zero control machinery.
//!
//! [`plugin::UsbPlugin`] packages a controller, guest memory, an interrupt
//! line and a device tree behind the host-side lifecycle surface
//! (MMIO access, clock advance, save/restore).

pub mod device;
pub mod hid;
pub mod hub;
pub mod memory;
pub mod ohci;
pub mod plugin;
pub mod snapshot;
pub mod storage;

use std::any::Any;

pub use device::{AttachedUsbDevice, UsbInResult, UsbOutResult};
pub use memory::{MemoryAccessError, MemoryBus};

use thiserror::Error;

/// Bus signalling speed of a device. OHCI handles full and low speed only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Full,
    Low,
}

/// The eight-byte SETUP payload of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

/// `bmRequestType` bits 5..6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// `bmRequestType` bits 0..4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestRecipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved,
}

impl SetupPacket {
    pub fn from_bytes(b: [u8; 8]) -> Self {
        Self {
            bm_request_type: b[0],
            b_request: b[1],
            w_value: u16::from_le_bytes([b[2], b[3]]),
            w_index: u16::from_le_bytes([b[4], b[5]]),
            w_length: u16::from_le_bytes([b[6], b[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let v = self.w_value.to_le_bytes();
        let i = self.w_index.to_le_bytes();
        let l = self.w_length.to_le_bytes();
        [
            self.bm_request_type,
            self.b_request,
            v[0],
            v[1],
            i[0],
            i[1],
            l[0],
            l[1],
        ]
    }

    /// True when the data stage (if any) moves device to host.
    pub fn is_device_to_host(&self) -> bool {
        self.bm_request_type & 0x80 != 0
    }

    pub fn request_type(&self) -> RequestType {
        match (self.bm_request_type >> 5) & 0x3 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> RequestRecipient {
        match self.bm_request_type & 0x1f {
            0 => RequestRecipient::Device,
            1 => RequestRecipient::Interface,
            2 => RequestRecipient::Endpoint,
            3 => RequestRecipient::Other,
            _ => RequestRecipient::Reserved,
        }
    }

    /// High byte of `wValue` for GET_DESCRIPTOR.
    pub fn descriptor_type(&self) -> u8 {
        (self.w_value >> 8) as u8
    }

    /// Low byte of `wValue` for GET_DESCRIPTOR.
    pub fn descriptor_index(&self) -> u8 {
        self.w_value as u8
    }
}

// Standard request codes.
pub const REQ_GET_STATUS: u8 = 0;
pub const REQ_CLEAR_FEATURE: u8 = 1;
pub const REQ_SET_FEATURE: u8 = 3;
pub const REQ_SET_ADDRESS: u8 = 5;
pub const REQ_GET_DESCRIPTOR: u8 = 6;
pub const REQ_SET_DESCRIPTOR: u8 = 7;
pub const REQ_GET_CONFIGURATION: u8 = 8;
pub const REQ_SET_CONFIGURATION: u8 = 9;
pub const REQ_GET_INTERFACE: u8 = 10;
pub const REQ_SET_INTERFACE: u8 = 11;

// Standard descriptor types.
pub const DESC_DEVICE: u8 = 1;
pub const DESC_CONFIGURATION: u8 = 2;
pub const DESC_STRING: u8 = 3;
pub const DESC_INTERFACE: u8 = 4;
pub const DESC_ENDPOINT: u8 = 5;

/// Outcome of a control request handled by a device model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    /// IN data stage payload. The ep0 machine truncates to `wLength`.
    Data(Vec<u8>),
    /// Request accepted, no data to return.
    Ack,
    /// Request error; ep0 halts until the next SETUP.
    Stall,
}

impl ControlResponse {
    /// Clamps an IN response to the host-requested length.
    pub fn data_clamped(mut data: Vec<u8>, w_length: u16) -> Self {
        data.truncate(w_length as usize);
        ControlResponse::Data(data)
    }
}

/// Completion of a previously deferred (asynchronous) endpoint transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncResult {
    In(UsbInResult),
    Out(UsbOutResult),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncCompletion {
    pub endpoint: u8,
    pub result: AsyncResult,
}

/// Behavior of one emulated USB function (the "personality").
///
/// Models answer transactions synchronously in the common case. A model that
/// needs time may answer `Async`; the controller then parks the transfer in
/// its single pending-packet slot and polls [`Self::poll_async_completion`]
/// until the model resolves it (or the packet is cancelled).
pub trait UsbDeviceModel: 'static {
    fn speed(&self) -> UsbSpeed {
        UsbSpeed::Full
    }

    /// Bus reset. Must drop all transfer state and halted endpoints.
    fn reset(&mut self);

    /// A complete control request: SETUP plus, for host-to-device requests
    /// with a data stage, the assembled OUT payload.
    fn handle_control_request(
        &mut self,
        setup: &SetupPacket,
        data_stage: Option<&[u8]>,
    ) -> ControlResponse;

    /// IN token on a non-zero endpoint.
    fn handle_data_in(&mut self, _endpoint: u8, _max_len: usize) -> UsbInResult {
        UsbInResult::Stall
    }

    /// OUT token on a non-zero endpoint.
    fn handle_data_out(&mut self, _endpoint: u8, _data: &[u8]) -> UsbOutResult {
        UsbOutResult::Stall
    }

    /// Polled while this model owns the controller's pending packet slot.
    fn poll_async_completion(&mut self) -> Option<AsyncCompletion> {
        None
    }

    /// The pending packet this model owns was cancelled (list disabled,
    /// endpoint paused, detach, controller reset).
    fn cancel_async(&mut self) {}

    fn set_suspended(&mut self, _suspended: bool) {}

    /// True when a suspended device is signalling remote wakeup.
    fn poll_remote_wakeup(&mut self) -> bool {
        false
    }

    /// Downcast for hub-aware topology walks.
    fn as_hub(&self) -> Option<&hub::UsbHubDevice> {
        None
    }

    fn as_hub_mut(&mut self) -> Option<&mut hub::UsbHubDevice> {
        None
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Why a device could not be mounted at the requested position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UsbHubAttachError {
    #[error("port index out of range")]
    InvalidPort,
    #[error("port already occupied")]
    PortOccupied,
    #[error("no device at the given position")]
    NoDevice,
}

/// Builds a UTF-16LE string descriptor body.
pub(crate) fn string_descriptor(s: &str) -> Vec<u8> {
    let mut out = vec![0, DESC_STRING];
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out[0] = out.len() as u8;
    out
}

/// Descriptor 0: supported language IDs (US English).
pub(crate) fn langid_descriptor() -> Vec<u8> {
    vec![4, DESC_STRING, 0x09, 0x04]
}
