//! HID boot-protocol pointer and keyboard personalities.
//!
//! Both are low-speed devices with a single interrupt IN endpoint. Host
//! input arrives through [`UsbHidMouse::motion`] / [`UsbHidMouse::set_buttons`]
//! and [`UsbHidKeyboard::key_event`]; the guest drains it with interrupt IN
//! polls, which NAK while nothing is queued.

use std::any::Any;
use std::collections::VecDeque;

use crate::{
    langid_descriptor, string_descriptor, ControlResponse, RequestRecipient, RequestType,
    SetupPacket, UsbDeviceModel, UsbInResult, UsbOutResult, UsbSpeed,
};
use io_snapshot::state::codec::{Decoder, Encoder};
use io_snapshot::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};

// HID class descriptor types.
const DESC_HID: u8 = 0x21;
const DESC_HID_REPORT: u8 = 0x22;

// HID class request codes.
const REQ_GET_REPORT: u8 = 0x01;
const REQ_GET_IDLE: u8 = 0x02;
const REQ_GET_PROTOCOL: u8 = 0x03;
const REQ_SET_REPORT: u8 = 0x09;
const REQ_SET_IDLE: u8 = 0x0a;
const REQ_SET_PROTOCOL: u8 = 0x0b;

const FEAT_DEVICE_REMOTE_WAKEUP: u16 = 1;

const INTERRUPT_ENDPOINT: u8 = 1;

/// Boot-protocol mouse report descriptor: three buttons plus X, Y and wheel
/// relative axes.
const MOUSE_REPORT_DESCRIPTOR: [u8; 52] = [
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x02, // Usage (Mouse)
    0xa1, 0x01, // Collection (Application)
    0x09, 0x01, //   Usage (Pointer)
    0xa1, 0x00, //   Collection (Physical)
    0x05, 0x09, //     Usage Page (Button)
    0x19, 0x01, //     Usage Minimum (1)
    0x29, 0x03, //     Usage Maximum (3)
    0x15, 0x00, //     Logical Minimum (0)
    0x25, 0x01, //     Logical Maximum (1)
    0x95, 0x03, //     Report Count (3)
    0x75, 0x01, //     Report Size (1)
    0x81, 0x02, //     Input (Data, Variable, Absolute)
    0x95, 0x01, //     Report Count (1)
    0x75, 0x05, //     Report Size (5)
    0x81, 0x01, //     Input (Constant)
    0x05, 0x01, //     Usage Page (Generic Desktop)
    0x09, 0x30, //     Usage (X)
    0x09, 0x31, //     Usage (Y)
    0x09, 0x38, //     Usage (Wheel)
    0x15, 0x81, //     Logical Minimum (-127)
    0x25, 0x7f, //     Logical Maximum (127)
    0x75, 0x08, //     Report Size (8)
    0x95, 0x03, //     Report Count (3)
    0x81, 0x06, //     Input (Data, Variable, Relative)
    0xc0, //   End Collection
    0xc0, // End Collection
];

/// Boot-protocol keyboard report descriptor: modifier byte, reserved byte,
/// LED output report and six key slots.
const KEYBOARD_REPORT_DESCRIPTOR: [u8; 63] = [
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x06, // Usage (Keyboard)
    0xa1, 0x01, // Collection (Application)
    0x75, 0x01, //   Report Size (1)
    0x95, 0x08, //   Report Count (8)
    0x05, 0x07, //   Usage Page (Key Codes)
    0x19, 0xe0, //   Usage Minimum (224)
    0x29, 0xe7, //   Usage Maximum (231)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x01, //   Logical Maximum (1)
    0x81, 0x02, //   Input (Data, Variable, Absolute)
    0x95, 0x01, //   Report Count (1)
    0x75, 0x08, //   Report Size (8)
    0x81, 0x01, //   Input (Constant)
    0x95, 0x05, //   Report Count (5)
    0x75, 0x01, //   Report Size (1)
    0x05, 0x08, //   Usage Page (LEDs)
    0x19, 0x01, //   Usage Minimum (1)
    0x29, 0x05, //   Usage Maximum (5)
    0x91, 0x02, //   Output (Data, Variable, Absolute)
    0x95, 0x01, //   Report Count (1)
    0x75, 0x03, //   Report Size (3)
    0x91, 0x01, //   Output (Constant)
    0x95, 0x06, //   Report Count (6)
    0x75, 0x08, //   Report Size (8)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0xff, //   Logical Maximum (255)
    0x05, 0x07, //   Usage Page (Key Codes)
    0x19, 0x00, //   Usage Minimum (0)
    0x29, 0xff, //   Usage Maximum (255)
    0x81, 0x00, //   Input (Data, Array)
    0xc0, // End Collection
];

fn hid_device_descriptor(product_id: u16, protocol: u8) -> [u8; 18] {
    let pid = product_id.to_le_bytes();
    [
        18,   // bLength
        0x01, // bDescriptorType: device
        0x10, 0x01, // bcdUSB 1.1
        0x00, // bDeviceClass: per interface
        0x00, // bDeviceSubClass
        protocol, // bDeviceProtocol
        8,    // bMaxPacketSize0
        0x27, 0x06, // idVendor
        pid[0], pid[1], // idProduct
        0x00, 0x01, // bcdDevice
        1,    // iManufacturer
        2,    // iProduct
        0,    // iSerialNumber
        1,    // bNumConfigurations
    ]
}

fn hid_config_descriptor(interface_protocol: u8, report_len: u16, report_size: u8) -> Vec<u8> {
    let rl = report_len.to_le_bytes();
    vec![
        // Configuration descriptor.
        9,    // bLength
        0x02, // bDescriptorType: configuration
        34, 0, // wTotalLength
        1,    // bNumInterfaces
        1,    // bConfigurationValue
        0,    // iConfiguration
        0xa0, // bmAttributes: bus powered, remote wakeup
        50,   // bMaxPower, 100 mA
        // Interface descriptor.
        9,    // bLength
        0x04, // bDescriptorType: interface
        0,    // bInterfaceNumber
        0,    // bAlternateSetting
        1,    // bNumEndpoints
        0x03, // bInterfaceClass: HID
        0x01, // bInterfaceSubClass: boot
        interface_protocol, // 1 keyboard, 2 mouse
        0,    // iInterface
        // HID descriptor.
        9,    // bLength
        DESC_HID,
        0x01, 0x01, // bcdHID 1.01
        0x00, // bCountryCode
        0x01, // bNumDescriptors
        DESC_HID_REPORT,
        rl[0], rl[1],
        // Interrupt IN endpoint.
        7,    // bLength
        0x05, // bDescriptorType: endpoint
        0x80 | INTERRUPT_ENDPOINT,
        0x03, // bmAttributes: interrupt
        report_size, 0, // wMaxPacketSize
        0x0a, // bInterval
    ]
}

/// Common control-plane state of a boot HID function.
struct HidCore {
    configuration: u8,
    /// 0 boot, 1 report. Report protocol is the reset default.
    protocol: u8,
    idle: u8,
    remote_wakeup: bool,
}

impl HidCore {
    fn new() -> Self {
        Self {
            configuration: 0,
            protocol: 1,
            idle: 0,
            remote_wakeup: false,
        }
    }

    fn encode(&self, enc: Encoder) -> Encoder {
        enc.u8(self.configuration)
            .u8(self.protocol)
            .u8(self.idle)
            .bool(self.remote_wakeup)
    }

    fn decode(&mut self, d: &mut Decoder<'_>) -> SnapshotResult<()> {
        self.configuration = d.u8()?;
        self.protocol = d.u8()?;
        self.idle = d.u8()?;
        self.remote_wakeup = d.bool()?;
        Ok(())
    }

    /// Handles the requests every HID function answers the same way.
    /// `None` means the request is not one of them.
    fn handle_common(
        &mut self,
        setup: &SetupPacket,
        product: &'static str,
        device_desc: &[u8],
        config_desc: &[u8],
        report_desc: &[u8],
    ) -> Option<ControlResponse> {
        match (setup.request_type(), setup.recipient()) {
            (RequestType::Standard, RequestRecipient::Device) => match setup.b_request {
                crate::REQ_GET_DESCRIPTOR => Some(match setup.descriptor_type() {
                    crate::DESC_DEVICE => {
                        ControlResponse::data_clamped(device_desc.to_vec(), setup.w_length)
                    }
                    crate::DESC_CONFIGURATION => {
                        ControlResponse::data_clamped(config_desc.to_vec(), setup.w_length)
                    }
                    crate::DESC_STRING => match setup.descriptor_index() {
                        0 => ControlResponse::data_clamped(langid_descriptor(), setup.w_length),
                        1 => ControlResponse::data_clamped(
                            string_descriptor("Emulated"),
                            setup.w_length,
                        ),
                        2 => ControlResponse::data_clamped(
                            string_descriptor(product),
                            setup.w_length,
                        ),
                        _ => ControlResponse::Stall,
                    },
                    _ => ControlResponse::Stall,
                }),
                crate::REQ_SET_CONFIGURATION => {
                    self.configuration = setup.w_value as u8;
                    Some(ControlResponse::Ack)
                }
                crate::REQ_GET_CONFIGURATION => {
                    Some(ControlResponse::Data(vec![self.configuration]))
                }
                crate::REQ_GET_STATUS => {
                    let status: u16 = u16::from(self.remote_wakeup) << 1;
                    Some(ControlResponse::data_clamped(
                        status.to_le_bytes().to_vec(),
                        setup.w_length,
                    ))
                }
                crate::REQ_SET_FEATURE if setup.w_value == FEAT_DEVICE_REMOTE_WAKEUP => {
                    self.remote_wakeup = true;
                    Some(ControlResponse::Ack)
                }
                crate::REQ_CLEAR_FEATURE if setup.w_value == FEAT_DEVICE_REMOTE_WAKEUP => {
                    self.remote_wakeup = false;
                    Some(ControlResponse::Ack)
                }
                _ => Some(ControlResponse::Stall),
            },
            (RequestType::Standard, RequestRecipient::Interface) => match setup.b_request {
                crate::REQ_GET_DESCRIPTOR if setup.descriptor_type() == DESC_HID_REPORT => {
                    Some(ControlResponse::data_clamped(
                        report_desc.to_vec(),
                        setup.w_length,
                    ))
                }
                crate::REQ_GET_DESCRIPTOR if setup.descriptor_type() == DESC_HID => Some(
                    ControlResponse::data_clamped(config_desc[18..27].to_vec(), setup.w_length),
                ),
                crate::REQ_GET_INTERFACE => Some(ControlResponse::Data(vec![0])),
                crate::REQ_SET_INTERFACE if setup.w_value == 0 => Some(ControlResponse::Ack),
                _ => Some(ControlResponse::Stall),
            },
            (RequestType::Class, RequestRecipient::Interface) => match setup.b_request {
                REQ_GET_IDLE => Some(ControlResponse::Data(vec![self.idle])),
                REQ_SET_IDLE => {
                    self.idle = (setup.w_value >> 8) as u8;
                    Some(ControlResponse::Ack)
                }
                REQ_GET_PROTOCOL => Some(ControlResponse::Data(vec![self.protocol])),
                REQ_SET_PROTOCOL => {
                    self.protocol = setup.w_value as u8;
                    Some(ControlResponse::Ack)
                }
                _ => None,
            },
            _ => Some(ControlResponse::Stall),
        }
    }
}

pub struct UsbHidMouse {
    core: HidCore,
    buttons: u8,
    dx: i32,
    dy: i32,
    wheel: i32,
    /// Set on button edges so a click with no motion still yields a report.
    buttons_dirty: bool,
}

impl UsbHidMouse {
    pub fn new() -> Self {
        Self {
            core: HidCore::new(),
            buttons: 0,
            dx: 0,
            dy: 0,
            wheel: 0,
            buttons_dirty: false,
        }
    }

    /// Accumulates relative motion from the host.
    pub fn motion(&mut self, dx: i32, dy: i32, wheel: i32) {
        self.dx += dx;
        self.dy += dy;
        self.wheel += wheel;
    }

    /// Bit 0 left, bit 1 right, bit 2 middle.
    pub fn set_buttons(&mut self, buttons: u8) {
        if buttons & 0x07 != self.buttons {
            self.buttons = buttons & 0x07;
            self.buttons_dirty = true;
        }
    }

    fn has_event(&self) -> bool {
        self.buttons_dirty || self.dx != 0 || self.dy != 0 || self.wheel != 0
    }

    /// Emits one 4-byte boot report, draining up to one report's worth of
    /// accumulated motion.
    fn poll_report(&mut self) -> [u8; 4] {
        let dx = self.dx.clamp(-127, 127);
        let dy = self.dy.clamp(-127, 127);
        let wheel = self.wheel.clamp(-127, 127);
        self.dx -= dx;
        self.dy -= dy;
        self.wheel -= wheel;
        self.buttons_dirty = false;
        [self.buttons, dx as i8 as u8, dy as i8 as u8, wheel as i8 as u8]
    }
}

impl Default for UsbHidMouse {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbDeviceModel for UsbHidMouse {
    fn speed(&self) -> UsbSpeed {
        UsbSpeed::Low
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn handle_control_request(
        &mut self,
        setup: &SetupPacket,
        _data_stage: Option<&[u8]>,
    ) -> ControlResponse {
        let config = hid_config_descriptor(2, MOUSE_REPORT_DESCRIPTOR.len() as u16, 4);
        if let Some(r) = self.core.handle_common(
            setup,
            "USB Mouse",
            &hid_device_descriptor(0x0001, 0),
            &config,
            &MOUSE_REPORT_DESCRIPTOR,
        ) {
            return r;
        }
        match setup.b_request {
            REQ_GET_REPORT => {
                ControlResponse::data_clamped(self.poll_report().to_vec(), setup.w_length)
            }
            _ => ControlResponse::Stall,
        }
    }

    fn handle_data_in(&mut self, endpoint: u8, max_len: usize) -> UsbInResult {
        if endpoint != INTERRUPT_ENDPOINT {
            return UsbInResult::Stall;
        }
        if !self.has_event() {
            return UsbInResult::Nak;
        }
        let mut report = self.poll_report().to_vec();
        report.truncate(max_len);
        UsbInResult::Data(report)
    }

    fn poll_remote_wakeup(&mut self) -> bool {
        self.core.remote_wakeup && self.has_event()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

const TAG_CORE: u16 = 1;
const TAG_POINTER: u16 = 2;

impl IoSnapshot for UsbHidMouse {
    const DEVICE_ID: [u8; 4] = *b"HIDM";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_bytes(TAG_CORE, &self.core.encode(Encoder::new()).finish());
        let pointer = Encoder::new()
            .u8(self.buttons)
            .u32(self.dx as u32)
            .u32(self.dy as u32)
            .u32(self.wheel as u32)
            .bool(self.buttons_dirty)
            .finish();
        w.field_bytes(TAG_POINTER, &pointer);
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;
        *self = Self::new();
        if let Some(core) = r.bytes(TAG_CORE) {
            let mut d = Decoder::new(core);
            self.core.decode(&mut d)?;
            d.finish()?;
        }
        if let Some(pointer) = r.bytes(TAG_POINTER) {
            let mut d = Decoder::new(pointer);
            self.buttons = d.u8()?;
            self.dx = d.u32()? as i32;
            self.dy = d.u32()? as i32;
            self.wheel = d.u32()? as i32;
            self.buttons_dirty = d.bool()?;
            d.finish()?;
        }
        Ok(())
    }
}

/// First key usage treated as a modifier (LeftControl).
const MODIFIER_BASE: u8 = 0xe0;
/// ErrorRollOver, reported in every key slot past six simultaneous keys.
const KEY_ERROR_ROLLOVER: u8 = 0x01;
const MAX_PRESSED: usize = 6;
const REPORT_QUEUE_LIMIT: usize = 32;

pub struct UsbHidKeyboard {
    core: HidCore,
    modifiers: u8,
    /// Non-modifier keys currently held, oldest first.
    pressed: Vec<u8>,
    reports: VecDeque<[u8; 8]>,
    leds: u8,
}

impl UsbHidKeyboard {
    pub fn new() -> Self {
        Self {
            core: HidCore::new(),
            modifiers: 0,
            pressed: Vec::new(),
            reports: VecDeque::new(),
            leds: 0,
        }
    }

    /// Key transition by HID usage code. Usages 0xe0..=0xe7 are modifiers.
    pub fn key_event(&mut self, usage: u8, down: bool) {
        if (MODIFIER_BASE..MODIFIER_BASE + 8).contains(&usage) {
            let bit = 1u8 << (usage - MODIFIER_BASE);
            let old = self.modifiers;
            if down {
                self.modifiers |= bit;
            } else {
                self.modifiers &= !bit;
            }
            if self.modifiers == old {
                return;
            }
        } else if down {
            if self.pressed.contains(&usage) {
                return;
            }
            self.pressed.push(usage);
        } else {
            let before = self.pressed.len();
            self.pressed.retain(|&k| k != usage);
            if self.pressed.len() == before {
                return;
            }
        }
        let report = self.build_report();
        if self.reports.len() == REPORT_QUEUE_LIMIT {
            self.reports.pop_front();
        }
        self.reports.push_back(report);
    }

    /// Output report LED bits: NumLock, CapsLock, ScrollLock, Compose, Kana.
    pub fn leds(&self) -> u8 {
        self.leds
    }

    fn build_report(&self) -> [u8; 8] {
        let mut report = [0u8; 8];
        report[0] = self.modifiers;
        if self.pressed.len() > MAX_PRESSED {
            report[2..].fill(KEY_ERROR_ROLLOVER);
        } else {
            for (slot, &key) in self.pressed.iter().enumerate() {
                report[2 + slot] = key;
            }
        }
        report
    }
}

impl Default for UsbHidKeyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbDeviceModel for UsbHidKeyboard {
    fn speed(&self) -> UsbSpeed {
        UsbSpeed::Low
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn handle_control_request(
        &mut self,
        setup: &SetupPacket,
        data_stage: Option<&[u8]>,
    ) -> ControlResponse {
        let config = hid_config_descriptor(1, KEYBOARD_REPORT_DESCRIPTOR.len() as u16, 8);
        if let Some(r) = self.core.handle_common(
            setup,
            "USB Keyboard",
            &hid_device_descriptor(0x0002, 0),
            &config,
            &KEYBOARD_REPORT_DESCRIPTOR,
        ) {
            return r;
        }
        match setup.b_request {
            REQ_GET_REPORT => {
                ControlResponse::data_clamped(self.build_report().to_vec(), setup.w_length)
            }
            REQ_SET_REPORT => match data_stage.and_then(|d| d.first()) {
                Some(&leds) => {
                    self.leds = leds;
                    ControlResponse::Ack
                }
                None => ControlResponse::Stall,
            },
            _ => ControlResponse::Stall,
        }
    }

    fn handle_data_in(&mut self, endpoint: u8, max_len: usize) -> UsbInResult {
        if endpoint != INTERRUPT_ENDPOINT {
            return UsbInResult::Stall;
        }
        match self.reports.pop_front() {
            Some(report) => {
                let mut data = report.to_vec();
                data.truncate(max_len);
                UsbInResult::Data(data)
            }
            None => UsbInResult::Nak,
        }
    }

    fn handle_data_out(&mut self, endpoint: u8, data: &[u8]) -> UsbOutResult {
        // Some hosts send the LED report on the interrupt pipe.
        if endpoint != INTERRUPT_ENDPOINT {
            return UsbOutResult::Stall;
        }
        if let Some(&leds) = data.first() {
            self.leds = leds;
        }
        UsbOutResult::Ack
    }

    fn poll_remote_wakeup(&mut self) -> bool {
        self.core.remote_wakeup && !self.reports.is_empty()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

const TAG_KEYS: u16 = 2;
const TAG_REPORTS: u16 = 3;
const TAG_LEDS: u16 = 4;

impl IoSnapshot for UsbHidKeyboard {
    const DEVICE_ID: [u8; 4] = *b"HIDK";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_bytes(TAG_CORE, &self.core.encode(Encoder::new()).finish());
        let keys = Encoder::new().u8(self.modifiers).vec_u8(&self.pressed).finish();
        w.field_bytes(TAG_KEYS, &keys);
        let queued: Vec<Vec<u8>> = self.reports.iter().map(|r| r.to_vec()).collect();
        w.field_bytes(TAG_REPORTS, &Encoder::new().vec_bytes(&queued).finish());
        w.field_u8(TAG_LEDS, self.leds);
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;
        *self = Self::new();
        if let Some(core) = r.bytes(TAG_CORE) {
            let mut d = Decoder::new(core);
            self.core.decode(&mut d)?;
            d.finish()?;
        }
        if let Some(keys) = r.bytes(TAG_KEYS) {
            let mut d = Decoder::new(keys);
            self.modifiers = d.u8()?;
            self.pressed = d.vec_u8()?;
            d.finish()?;
        }
        if let Some(reports) = r.bytes(TAG_REPORTS) {
            let mut d = Decoder::new(reports);
            for entry in d.vec_bytes()? {
                let report: [u8; 8] = entry
                    .try_into()
                    .map_err(|_| SnapshotError::InvalidFieldEncoding("keyboard report"))?;
                self.reports.push_back(report);
            }
            d.finish()?;
        }
        self.leds = r.u8(TAG_LEDS)?.unwrap_or(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_descriptor(kind: u8, len: u16) -> SetupPacket {
        SetupPacket {
            bm_request_type: 0x80,
            b_request: crate::REQ_GET_DESCRIPTOR,
            w_value: (kind as u16) << 8,
            w_index: 0,
            w_length: len,
        }
    }

    #[test]
    fn mouse_naks_until_input_arrives() {
        let mut mouse = UsbHidMouse::new();
        assert_eq!(mouse.handle_data_in(1, 4), UsbInResult::Nak);
        mouse.motion(3, -2, 0);
        assert_eq!(
            mouse.handle_data_in(1, 4),
            UsbInResult::Data(vec![0, 3, 0xfe, 0])
        );
        assert_eq!(mouse.handle_data_in(1, 4), UsbInResult::Nak);
    }

    #[test]
    fn mouse_motion_saturates_per_report() {
        let mut mouse = UsbHidMouse::new();
        mouse.motion(300, 0, 0);
        assert_eq!(
            mouse.handle_data_in(1, 4),
            UsbInResult::Data(vec![0, 127, 0, 0])
        );
        // Remainder carries into the next report.
        assert_eq!(
            mouse.handle_data_in(1, 4),
            UsbInResult::Data(vec![0, 127, 0, 0])
        );
        assert_eq!(
            mouse.handle_data_in(1, 4),
            UsbInResult::Data(vec![0, 46, 0, 0])
        );
    }

    #[test]
    fn button_edge_without_motion_reports() {
        let mut mouse = UsbHidMouse::new();
        mouse.set_buttons(0x01);
        assert_eq!(
            mouse.handle_data_in(1, 4),
            UsbInResult::Data(vec![1, 0, 0, 0])
        );
        assert_eq!(mouse.handle_data_in(1, 4), UsbInResult::Nak);
        mouse.set_buttons(0x00);
        assert_eq!(
            mouse.handle_data_in(1, 4),
            UsbInResult::Data(vec![0, 0, 0, 0])
        );
    }

    #[test]
    fn mouse_descriptors_parse() {
        let mut mouse = UsbHidMouse::new();
        let ControlResponse::Data(dev) =
            mouse.handle_control_request(&get_descriptor(crate::DESC_DEVICE, 18), None)
        else {
            panic!("expected data");
        };
        assert_eq!(dev.len(), 18);
        assert_eq!(dev[7], 8);
        let ControlResponse::Data(cfg) =
            mouse.handle_control_request(&get_descriptor(crate::DESC_CONFIGURATION, 255), None)
        else {
            panic!("expected data");
        };
        assert_eq!(cfg.len(), 34);
        assert_eq!(u16::from_le_bytes([cfg[2], cfg[3]]) as usize, cfg.len());
        // HID descriptor inside the configuration names the report length.
        assert_eq!(cfg[18 + 1], DESC_HID);
        assert_eq!(
            u16::from_le_bytes([cfg[18 + 7], cfg[18 + 8]]) as usize,
            MOUSE_REPORT_DESCRIPTOR.len()
        );
    }

    #[test]
    fn keyboard_queues_transition_reports() {
        let mut kbd = UsbHidKeyboard::new();
        kbd.key_event(0x04, true); // A
        kbd.key_event(0xe1, true); // LeftShift
        kbd.key_event(0x04, false);
        let r1 = kbd.handle_data_in(1, 8);
        assert_eq!(r1, UsbInResult::Data(vec![0, 0, 0x04, 0, 0, 0, 0, 0]));
        let r2 = kbd.handle_data_in(1, 8);
        assert_eq!(r2, UsbInResult::Data(vec![0x02, 0, 0x04, 0, 0, 0, 0, 0]));
        let r3 = kbd.handle_data_in(1, 8);
        assert_eq!(r3, UsbInResult::Data(vec![0x02, 0, 0, 0, 0, 0, 0, 0]));
        assert_eq!(kbd.handle_data_in(1, 8), UsbInResult::Nak);
    }

    #[test]
    fn seventh_key_reports_rollover() {
        let mut kbd = UsbHidKeyboard::new();
        for usage in 0x04..0x0b {
            kbd.key_event(usage, true);
        }
        // Drain to the newest report.
        let mut last = None;
        while let UsbInResult::Data(d) = kbd.handle_data_in(1, 8) {
            last = Some(d);
        }
        let report = last.unwrap();
        assert!(report[2..].iter().all(|&k| k == KEY_ERROR_ROLLOVER));
        // Releasing one key returns to a normal report.
        kbd.key_event(0x04, false);
        let UsbInResult::Data(report) = kbd.handle_data_in(1, 8) else {
            panic!("expected data");
        };
        assert_eq!(&report[2..], &[0x05, 0x06, 0x07, 0x08, 0x09, 0x0a]);
    }

    #[test]
    fn set_report_latches_leds() {
        let mut kbd = UsbHidKeyboard::new();
        let setup = SetupPacket {
            bm_request_type: 0x21,
            b_request: REQ_SET_REPORT,
            w_value: 0x0200,
            w_index: 0,
            w_length: 1,
        };
        assert_eq!(
            kbd.handle_control_request(&setup, Some(&[0x03])),
            ControlResponse::Ack
        );
        assert_eq!(kbd.leds(), 0x03);
    }

    #[test]
    fn protocol_and_idle_round_trip() {
        let mut mouse = UsbHidMouse::new();
        let set = SetupPacket {
            bm_request_type: 0x21,
            b_request: REQ_SET_PROTOCOL,
            w_value: 0,
            w_index: 0,
            w_length: 0,
        };
        assert_eq!(mouse.handle_control_request(&set, None), ControlResponse::Ack);
        let get = SetupPacket {
            bm_request_type: 0xa1,
            b_request: REQ_GET_PROTOCOL,
            w_value: 0,
            w_index: 0,
            w_length: 1,
        };
        assert_eq!(
            mouse.handle_control_request(&get, None),
            ControlResponse::Data(vec![0])
        );
    }

    #[test]
    fn keyboard_snapshot_preserves_queue_and_keys() {
        let mut kbd = UsbHidKeyboard::new();
        kbd.key_event(0x04, true);
        kbd.key_event(0x05, true);
        kbd.leds = 0x02;
        let blob = kbd.save_state();

        let mut restored = UsbHidKeyboard::new();
        restored.load_state(&blob).unwrap();
        assert_eq!(restored.leds(), 0x02);
        assert_eq!(restored.pressed, vec![0x04, 0x05]);
        assert_eq!(restored.reports.len(), 2);
        // Releasing a restored key still produces a consistent report.
        restored.key_event(0x04, false);
        assert_eq!(restored.reports.back().unwrap()[2], 0x05);
    }
}
