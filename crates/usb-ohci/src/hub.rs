//! External USB hub device model (class 0x09).
//!
//! Downstream devices hang off numbered ports, each with the standard
//! status/change word pair. The status-change interrupt endpoint reports a
//! bitmap (bit 0 hub, bit N port N) and NAKs while nothing changed. Tokens
//! addressed to downstream functions pass through transparently via
//! [`UsbHubDevice::device_mut_for_address`].

use std::any::Any;

use log::trace;

use crate::device::AttachedUsbDevice;
use crate::{
    langid_descriptor, string_descriptor, ControlResponse, RequestRecipient, RequestType,
    SetupPacket, UsbDeviceModel, UsbHubAttachError, UsbInResult, UsbSpeed,
};
use io_snapshot::state::codec::{Decoder, Encoder};
use io_snapshot::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};

// wPortStatus bits.
const PORT_STAT_CONNECTION: u16 = 1 << 0;
const PORT_STAT_ENABLE: u16 = 1 << 1;
const PORT_STAT_SUSPEND: u16 = 1 << 2;
const PORT_STAT_RESET: u16 = 1 << 4;
const PORT_STAT_POWER: u16 = 1 << 8;
const PORT_STAT_LOW_SPEED: u16 = 1 << 9;

// wPortChange bits (same positions as the low status bits).
const PORT_C_CONNECTION: u16 = 1 << 0;
const PORT_C_ENABLE: u16 = 1 << 1;
const PORT_C_SUSPEND: u16 = 1 << 2;
const PORT_C_RESET: u16 = 1 << 4;

// Hub class feature selectors.
const FEAT_PORT_CONNECTION: u16 = 0;
const FEAT_PORT_ENABLE: u16 = 1;
const FEAT_PORT_SUSPEND: u16 = 2;
const FEAT_PORT_RESET: u16 = 4;
const FEAT_PORT_POWER: u16 = 8;
const FEAT_C_PORT_CONNECTION: u16 = 16;
const FEAT_C_PORT_ENABLE: u16 = 17;
const FEAT_C_PORT_SUSPEND: u16 = 18;
const FEAT_C_PORT_OVER_CURRENT: u16 = 19;
const FEAT_C_PORT_RESET: u16 = 20;

const HUB_DESCRIPTOR_TYPE: u8 = 0x29;
const STATUS_CHANGE_ENDPOINT: u8 = 1;

const HUB_DEVICE_DESCRIPTOR: [u8; 18] = [
    18,   // bLength
    0x01, // bDescriptorType: device
    0x10, 0x01, // bcdUSB 1.1
    0x09, // bDeviceClass: hub
    0x00, // bDeviceSubClass
    0x00, // bDeviceProtocol
    8,    // bMaxPacketSize0
    0x09, 0x04, // idVendor
    0x5a, 0x00, // idProduct
    0x00, 0x01, // bcdDevice
    1,    // iManufacturer
    2,    // iProduct
    0,    // iSerialNumber
    1,    // bNumConfigurations
];

struct HubPort {
    device: Option<AttachedUsbDevice>,
    status: u16,
    change: u16,
}

impl HubPort {
    fn new() -> Self {
        Self {
            device: None,
            status: 0,
            change: 0,
        }
    }
}

pub struct UsbHubDevice {
    ports: Vec<HubPort>,
    configuration: u8,
    remote_wakeup: bool,
}

impl UsbHubDevice {
    pub fn new(num_ports: usize) -> Self {
        Self {
            ports: (0..num_ports).map(|_| HubPort::new()).collect(),
            configuration: 0,
            remote_wakeup: false,
        }
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    /// Mounts a device on downstream port `index` (zero-based).
    pub fn attach(
        &mut self,
        index: usize,
        device: AttachedUsbDevice,
    ) -> Result<(), UsbHubAttachError> {
        let port = self
            .ports
            .get_mut(index)
            .ok_or(UsbHubAttachError::InvalidPort)?;
        if port.device.is_some() {
            return Err(UsbHubAttachError::PortOccupied);
        }
        port.status |= PORT_STAT_CONNECTION;
        if device.speed() == UsbSpeed::Low {
            port.status |= PORT_STAT_LOW_SPEED;
        }
        port.change |= PORT_C_CONNECTION;
        port.device = Some(device);
        trace!("usb-hub: attached device to port {index}");
        Ok(())
    }

    pub fn detach(&mut self, index: usize) -> Result<AttachedUsbDevice, UsbHubAttachError> {
        let port = self
            .ports
            .get_mut(index)
            .ok_or(UsbHubAttachError::InvalidPort)?;
        let mut device = port.device.take().ok_or(UsbHubAttachError::NoDevice)?;
        device.cancel_async();
        let was_enabled = port.status & PORT_STAT_ENABLE != 0;
        port.status &= !(PORT_STAT_CONNECTION | PORT_STAT_ENABLE | PORT_STAT_LOW_SPEED);
        port.change |= PORT_C_CONNECTION;
        if was_enabled {
            port.change |= PORT_C_ENABLE;
        }
        trace!("usb-hub: detached device from port {index}");
        Ok(device)
    }

    /// Transparent downstream routing over enabled ports.
    pub fn device_mut_for_address(&mut self, address: u8) -> Option<&mut AttachedUsbDevice> {
        self.ports
            .iter_mut()
            .filter(|p| p.status & PORT_STAT_ENABLE != 0)
            .filter_map(|p| p.device.as_mut())
            .find_map(|d| d.device_mut_for_address(address))
    }

    pub(crate) fn propagate_suspend(&mut self, suspended: bool) {
        for port in &mut self.ports {
            if let Some(dev) = port.device.as_mut() {
                dev.set_suspended(suspended);
            }
        }
    }

    pub(crate) fn poll_downstream_wakeup(&mut self) -> bool {
        let mut woke = false;
        for port in &mut self.ports {
            if let Some(dev) = port.device.as_mut() {
                if dev.poll_remote_wakeup() {
                    if port.status & PORT_STAT_SUSPEND != 0 {
                        port.status &= !PORT_STAT_SUSPEND;
                        port.change |= PORT_C_SUSPEND;
                    }
                    woke = true;
                }
            }
        }
        woke
    }

    fn hub_descriptor(&self) -> Vec<u8> {
        let n = self.ports.len();
        let bitmap_len = n / 8 + 1;
        let mut d = vec![
            (7 + 2 * bitmap_len) as u8, // bDescLength
            HUB_DESCRIPTOR_TYPE,        // bDescriptorType
            n as u8,                    // bNbrPorts
            0x11,                       // wHubCharacteristics: per-port power and overcurrent
            0x00,
            50,   // bPwrOn2PwrGood, 2 ms units
            0x64, // bHubContrCurrent
        ];
        d.extend(std::iter::repeat(0x00).take(bitmap_len)); // DeviceRemovable
        d.extend(std::iter::repeat(0xff).take(bitmap_len)); // PortPwrCtrlMask
        d
    }

    fn config_descriptor(&self) -> Vec<u8> {
        let max_packet = (self.ports.len() / 8 + 1) as u8;
        vec![
            // Configuration descriptor.
            9,    // bLength
            0x02, // bDescriptorType: configuration
            25, 0, // wTotalLength
            1,    // bNumInterfaces
            1,    // bConfigurationValue
            0,    // iConfiguration
            0xe0, // bmAttributes: self powered, remote wakeup
            0,    // bMaxPower
            // Interface descriptor.
            9,    // bLength
            0x04, // bDescriptorType: interface
            0,    // bInterfaceNumber
            0,    // bAlternateSetting
            1,    // bNumEndpoints
            0x09, // bInterfaceClass: hub
            0,    // bInterfaceSubClass
            0,    // bInterfaceProtocol
            0,    // iInterface
            // Status change endpoint.
            7,    // bLength
            0x05, // bDescriptorType: endpoint
            0x80 | STATUS_CHANGE_ENDPOINT, // bEndpointAddress: IN
            0x03, // bmAttributes: interrupt
            max_packet, 0, // wMaxPacketSize
            0xff, // bInterval
        ]
    }

    fn port_status_reply(&self, index: usize) -> ControlResponse {
        match self.ports.get(index) {
            Some(port) => {
                let mut out = Vec::with_capacity(4);
                out.extend_from_slice(&port.status.to_le_bytes());
                out.extend_from_slice(&port.change.to_le_bytes());
                ControlResponse::Data(out)
            }
            None => ControlResponse::Stall,
        }
    }

    fn set_port_feature(&mut self, index: usize, feature: u16) -> ControlResponse {
        let Some(port) = self.ports.get_mut(index) else {
            return ControlResponse::Stall;
        };
        match feature {
            FEAT_PORT_POWER => port.status |= PORT_STAT_POWER,
            FEAT_PORT_SUSPEND => {
                if port.status & PORT_STAT_CONNECTION != 0 {
                    port.status |= PORT_STAT_SUSPEND;
                    if let Some(dev) = port.device.as_mut() {
                        dev.set_suspended(true);
                    }
                }
            }
            FEAT_PORT_RESET => {
                if let Some(dev) = port.device.as_mut() {
                    dev.reset();
                    // Reset signalling completes immediately; the port comes
                    // back enabled.
                    port.status |= PORT_STAT_ENABLE;
                    port.status &= !(PORT_STAT_SUSPEND | PORT_STAT_RESET);
                    port.change |= PORT_C_RESET;
                }
            }
            FEAT_PORT_ENABLE | FEAT_PORT_CONNECTION => {}
            _ => return ControlResponse::Stall,
        }
        ControlResponse::Ack
    }

    fn clear_port_feature(&mut self, index: usize, feature: u16) -> ControlResponse {
        let Some(port) = self.ports.get_mut(index) else {
            return ControlResponse::Stall;
        };
        match feature {
            FEAT_PORT_POWER => port.status &= !PORT_STAT_POWER,
            FEAT_PORT_ENABLE => {
                port.status &= !PORT_STAT_ENABLE;
            }
            FEAT_PORT_SUSPEND => {
                if port.status & PORT_STAT_SUSPEND != 0 {
                    port.status &= !PORT_STAT_SUSPEND;
                    if let Some(dev) = port.device.as_mut() {
                        dev.set_suspended(false);
                    }
                }
            }
            FEAT_C_PORT_CONNECTION => port.change &= !PORT_C_CONNECTION,
            FEAT_C_PORT_ENABLE => port.change &= !PORT_C_ENABLE,
            FEAT_C_PORT_SUSPEND => port.change &= !PORT_C_SUSPEND,
            FEAT_C_PORT_OVER_CURRENT => {}
            FEAT_C_PORT_RESET => port.change &= !PORT_C_RESET,
            _ => return ControlResponse::Stall,
        }
        ControlResponse::Ack
    }

    fn get_descriptor(&self, setup: &SetupPacket) -> ControlResponse {
        let data = match setup.descriptor_type() {
            crate::DESC_DEVICE => HUB_DEVICE_DESCRIPTOR.to_vec(),
            crate::DESC_CONFIGURATION => self.config_descriptor(),
            crate::DESC_STRING => match setup.descriptor_index() {
                0 => langid_descriptor(),
                1 => string_descriptor("Emulated"),
                2 => string_descriptor("USB Hub"),
                _ => return ControlResponse::Stall,
            },
            _ => return ControlResponse::Stall,
        };
        ControlResponse::data_clamped(data, setup.w_length)
    }
}

impl UsbDeviceModel for UsbHubDevice {
    fn reset(&mut self) {
        self.configuration = 0;
        self.remote_wakeup = false;
        for port in &mut self.ports {
            port.status &= !(PORT_STAT_ENABLE | PORT_STAT_SUSPEND | PORT_STAT_RESET);
            port.change = if port.device.is_some() {
                PORT_C_CONNECTION
            } else {
                0
            };
            if let Some(dev) = port.device.as_mut() {
                dev.reset();
            }
        }
    }

    fn handle_control_request(
        &mut self,
        setup: &SetupPacket,
        _data_stage: Option<&[u8]>,
    ) -> ControlResponse {
        match (setup.request_type(), setup.recipient()) {
            (RequestType::Standard, RequestRecipient::Device) => match setup.b_request {
                crate::REQ_GET_DESCRIPTOR => self.get_descriptor(setup),
                crate::REQ_SET_CONFIGURATION => {
                    self.configuration = setup.w_value as u8;
                    ControlResponse::Ack
                }
                crate::REQ_GET_CONFIGURATION => ControlResponse::Data(vec![self.configuration]),
                crate::REQ_GET_STATUS => {
                    // Self powered, plus remote wakeup when armed.
                    let status: u16 = 0x0001 | u16::from(self.remote_wakeup) << 1;
                    ControlResponse::data_clamped(status.to_le_bytes().to_vec(), setup.w_length)
                }
                crate::REQ_SET_FEATURE if setup.w_value == 1 => {
                    self.remote_wakeup = true;
                    ControlResponse::Ack
                }
                crate::REQ_CLEAR_FEATURE if setup.w_value == 1 => {
                    self.remote_wakeup = false;
                    ControlResponse::Ack
                }
                _ => ControlResponse::Stall,
            },
            (RequestType::Standard, RequestRecipient::Interface) => match setup.b_request {
                crate::REQ_GET_INTERFACE => ControlResponse::Data(vec![0]),
                crate::REQ_SET_INTERFACE if setup.w_value == 0 => ControlResponse::Ack,
                _ => ControlResponse::Stall,
            },
            (RequestType::Class, RequestRecipient::Device) => match setup.b_request {
                crate::REQ_GET_DESCRIPTOR if setup.descriptor_type() == HUB_DESCRIPTOR_TYPE => {
                    ControlResponse::data_clamped(self.hub_descriptor(), setup.w_length)
                }
                crate::REQ_GET_STATUS => ControlResponse::data_clamped(vec![0; 4], setup.w_length),
                _ => ControlResponse::Stall,
            },
            (RequestType::Class, RequestRecipient::Other) => {
                // Port requests are 1-based on the wire.
                let index = (setup.w_index as usize).wrapping_sub(1);
                match setup.b_request {
                    crate::REQ_GET_STATUS => self.port_status_reply(index),
                    crate::REQ_SET_FEATURE => self.set_port_feature(index, setup.w_value),
                    crate::REQ_CLEAR_FEATURE => self.clear_port_feature(index, setup.w_value),
                    _ => ControlResponse::Stall,
                }
            }
            _ => ControlResponse::Stall,
        }
    }

    fn handle_data_in(&mut self, endpoint: u8, max_len: usize) -> UsbInResult {
        if endpoint != STATUS_CHANGE_ENDPOINT {
            return UsbInResult::Stall;
        }
        let mut bitmap = vec![0u8; self.ports.len() / 8 + 1];
        let mut any = false;
        for (i, port) in self.ports.iter().enumerate() {
            if port.change != 0 {
                let bit = i + 1;
                bitmap[bit / 8] |= 1 << (bit % 8);
                any = true;
            }
        }
        if !any {
            return UsbInResult::Nak;
        }
        bitmap.truncate(max_len);
        UsbInResult::Data(bitmap)
    }

    fn set_suspended(&mut self, suspended: bool) {
        self.propagate_suspend(suspended);
    }

    fn poll_remote_wakeup(&mut self) -> bool {
        self.remote_wakeup && self.poll_downstream_wakeup()
    }

    fn as_hub(&self) -> Option<&UsbHubDevice> {
        Some(self)
    }

    fn as_hub_mut(&mut self) -> Option<&mut UsbHubDevice> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

const TAG_NUM_PORTS: u16 = 1;
const TAG_CONFIGURATION: u16 = 2;
const TAG_REMOTE_WAKEUP: u16 = 3;
const TAG_PORTS: u16 = 4;

impl IoSnapshot for UsbHubDevice {
    const DEVICE_ID: [u8; 4] = *b"UHUB";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u8(TAG_NUM_PORTS, self.ports.len() as u8);
        w.field_u8(TAG_CONFIGURATION, self.configuration);
        w.field_bool(TAG_REMOTE_WAKEUP, self.remote_wakeup);
        let mut enc = Encoder::new();
        for port in &self.ports {
            enc = enc.u16(port.status).u16(port.change);
            match &port.device {
                Some(dev) => enc = enc.bool(true).vec_u8(&dev.save_state()),
                None => enc = enc.bool(false),
            }
        }
        w.field_bytes(TAG_PORTS, &enc.finish());
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;
        let count = r
            .u8(TAG_NUM_PORTS)?
            .ok_or(SnapshotError::InvalidFieldEncoding("missing port count"))?
            as usize;
        let blob = r
            .bytes(TAG_PORTS)
            .ok_or(SnapshotError::InvalidFieldEncoding("missing hub ports"))?;
        let mut d = Decoder::new(blob);
        let mut ports = Vec::with_capacity(count);
        for _ in 0..count {
            let status = d.u16()?;
            let change = d.u16()?;
            let device = if d.bool()? {
                let dev_blob = d.vec_u8()?;
                Some(AttachedUsbDevice::restore(&dev_blob)?)
            } else {
                None
            };
            ports.push(HubPort {
                device,
                status,
                change,
            });
        }
        d.finish()?;
        self.ports = ports;
        self.configuration = r.u8(TAG_CONFIGURATION)?.unwrap_or(0);
        self.remote_wakeup = r.bool(TAG_REMOTE_WAKEUP)?.unwrap_or(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::UsbOutResult;

    struct Probe;

    impl UsbDeviceModel for Probe {
        fn reset(&mut self) {}
        fn handle_control_request(
            &mut self,
            setup: &SetupPacket,
            _data: Option<&[u8]>,
        ) -> ControlResponse {
            if setup.is_device_to_host() {
                ControlResponse::Data(vec![0x42])
            } else {
                ControlResponse::Ack
            }
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn probe() -> AttachedUsbDevice {
        AttachedUsbDevice::new(Box::new(Probe))
    }

    fn class_other(req: u8, value: u16, index: u16) -> SetupPacket {
        SetupPacket {
            bm_request_type: 0x23,
            b_request: req,
            w_value: value,
            w_index: index,
            w_length: 0,
        }
    }

    #[test]
    fn attach_reports_connection_and_change() {
        let mut hub = UsbHubDevice::new(4);
        hub.attach(1, probe()).unwrap();
        let reply = hub.handle_control_request(
            &SetupPacket {
                bm_request_type: 0xa3,
                b_request: crate::REQ_GET_STATUS,
                w_value: 0,
                w_index: 2,
                w_length: 4,
            },
            None,
        );
        let ControlResponse::Data(d) = reply else {
            panic!("expected data");
        };
        let status = u16::from_le_bytes([d[0], d[1]]);
        let change = u16::from_le_bytes([d[2], d[3]]);
        assert_ne!(status & PORT_STAT_CONNECTION, 0);
        assert_ne!(change & PORT_C_CONNECTION, 0);
    }

    #[test]
    fn status_change_endpoint_reports_bitmap_then_naks() {
        let mut hub = UsbHubDevice::new(4);
        hub.attach(2, probe()).unwrap();
        match hub.handle_data_in(STATUS_CHANGE_ENDPOINT, 8) {
            UsbInResult::Data(bitmap) => assert_eq!(bitmap[0], 1 << 3),
            other => panic!("unexpected {other:?}"),
        }
        // Acknowledge the change; the endpoint then NAKs.
        hub.handle_control_request(&class_other(crate::REQ_CLEAR_FEATURE, FEAT_C_PORT_CONNECTION, 3), None);
        assert_eq!(hub.handle_data_in(STATUS_CHANGE_ENDPOINT, 8), UsbInResult::Nak);
    }

    #[test]
    fn port_reset_enables_and_routes() {
        let mut hub = UsbHubDevice::new(4);
        hub.attach(0, probe()).unwrap();
        assert!(hub.device_mut_for_address(0).is_none());
        hub.handle_control_request(&class_other(crate::REQ_SET_FEATURE, FEAT_PORT_RESET, 1), None);
        assert!(hub.device_mut_for_address(0).is_some());
    }

    #[test]
    fn broadcast_reaches_exactly_one_default_device() {
        let mut hub = UsbHubDevice::new(4);
        hub.attach(0, probe()).unwrap();
        hub.attach(1, probe()).unwrap();
        hub.handle_control_request(&class_other(crate::REQ_SET_FEATURE, FEAT_PORT_RESET, 1), None);
        hub.handle_control_request(&class_other(crate::REQ_SET_FEATURE, FEAT_PORT_RESET, 2), None);
        // Address the first one.
        {
            let dev = hub.device_mut_for_address(0).unwrap();
            let setup = SetupPacket {
                bm_request_type: 0,
                b_request: crate::REQ_SET_ADDRESS,
                w_value: 5,
                w_index: 0,
                w_length: 0,
            };
            assert_eq!(dev.handle_setup_token(&setup.to_bytes()), UsbOutResult::Ack);
            dev.handle_in_token(0, 64);
            assert_eq!(dev.address(), 5);
        }
        // A broadcast to the default address now reaches only the second.
        let remaining = hub.device_mut_for_address(0).unwrap();
        assert_eq!(remaining.address(), 0);
        assert!(hub.device_mut_for_address(5).is_some());
        assert!(hub.device_mut_for_address(9).is_none());
    }

    #[test]
    fn detach_latches_connect_and_enable_changes() {
        let mut hub = UsbHubDevice::new(4);
        hub.attach(0, probe()).unwrap();
        hub.handle_control_request(&class_other(crate::REQ_SET_FEATURE, FEAT_PORT_RESET, 1), None);
        // Ack the attach-time changes so only the detach is left to report.
        hub.handle_control_request(
            &class_other(crate::REQ_CLEAR_FEATURE, FEAT_C_PORT_CONNECTION, 1),
            None,
        );
        hub.handle_control_request(&class_other(crate::REQ_CLEAR_FEATURE, FEAT_C_PORT_RESET, 1), None);
        assert!(hub.device_mut_for_address(0).is_some());

        hub.detach(0).unwrap();
        let reply = hub.handle_control_request(
            &SetupPacket {
                bm_request_type: 0xa3,
                b_request: crate::REQ_GET_STATUS,
                w_value: 0,
                w_index: 1,
                w_length: 4,
            },
            None,
        );
        let ControlResponse::Data(d) = reply else {
            panic!("expected data");
        };
        let status = u16::from_le_bytes([d[0], d[1]]);
        let change = u16::from_le_bytes([d[2], d[3]]);
        assert_eq!(status & (PORT_STAT_CONNECTION | PORT_STAT_ENABLE), 0);
        assert_ne!(change & PORT_C_CONNECTION, 0);
        assert_ne!(change & PORT_C_ENABLE, 0);
        assert!(hub.device_mut_for_address(0).is_none());
    }

    #[test]
    fn hub_descriptor_shape() {
        let mut hub = UsbHubDevice::new(4);
        let ControlResponse::Data(d) = hub.handle_control_request(
            &SetupPacket {
                bm_request_type: 0xa0,
                b_request: crate::REQ_GET_DESCRIPTOR,
                w_value: (HUB_DESCRIPTOR_TYPE as u16) << 8,
                w_index: 0,
                w_length: 64,
            },
            None,
        ) else {
            panic!("expected data");
        };
        assert_eq!(d[0] as usize, d.len());
        assert_eq!(d[1], HUB_DESCRIPTOR_TYPE);
        assert_eq!(d[2], 4);
    }

    #[test]
    fn snapshot_round_trip_preserves_topology() {
        let mut hub = UsbHubDevice::new(4);
        hub.attach(3, AttachedUsbDevice::new(Box::new(UsbHubDevice::new(2))))
            .unwrap();
        hub.handle_control_request(&class_other(crate::REQ_SET_FEATURE, FEAT_PORT_RESET, 4), None);
        let blob = hub.save_state();

        let mut restored = UsbHubDevice::new(0);
        restored.load_state(&blob).unwrap();
        assert_eq!(restored.num_ports(), 4);
        let inner = restored.device_mut_for_address(0).unwrap();
        assert!(inner.model().as_hub().is_some());
    }
}
