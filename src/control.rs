// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control requests aimed at our interfaces, and the state they leave behind.
//!
//! The only request we act on is SET_INTERFACE, which is how the host turns
//! the audio stream on (alternate setting 1) and off (alternate setting 0).
//! The selected alternate settings are kept in an `InterfaceState` owned by
//! the `ControlHandler`; the streaming engine borrows it to decide whether to
//! send anything. GET_INTERFACE reads them back, and GET_STATUS on an
//! interface gets the two zero bytes USB reserves for it.
//!
//! # Limitations
//!
//! The feature unit advertises a mute control, so a host may try GET_CUR or
//! SET_CUR on it. Neither is implemented: both come back as
//! `RequestError::Unsupported`, and the dispatcher stalls them. Mute is
//! cosmetic here.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use byteorder::LittleEndian;
use log::{debug, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, Unaligned, U16};

use crate::device::alternate_settings;
use crate::{Endpoints, UsbDir, EP0_MAX_PACKET_SIZE, NUM_INTERFACES};

/// Layout of an 8-byte USB SETUP packet.
#[repr(C)]
#[derive(Debug, AsBytes, FromBytes, Unaligned)]
pub struct UsbSetupPacket {
    /// Request type bit field: bit 7 is the direction (see `UsbDir`), bits
    /// 5..7 say standard/class/vendor, and bits 0..5 name the recipient
    /// (device, interface, endpoint).
    pub request_type: u8,
    /// Request. Standard setup requests are in the `UsbSetupRequest` enum.
    /// Devices can extend this with additional types as long as they don't
    /// conflict.
    pub request: u8,
    /// A simple argument of up to 16 bits, specific to the request.
    pub value: U16<LittleEndian>,
    /// Another argument; for requests aimed at an interface, its number.
    pub index: U16<LittleEndian>,
    /// If data will be transferred after this request (in the direction given
    /// by `request_type`), this gives the number of bytes (OUT) or maximum
    /// number of bytes (IN).
    pub length: U16<LittleEndian>,
}

/// The types of USB SETUP requests that we understand.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum UsbSetupRequest {
    /// Reads two bytes of status flags from the recipient. Always an IN.
    GetStatus = 0x00,
    /// Asks the device to send a certain descriptor back to the host. Always
    /// used on an IN request.
    GetDescriptor = 0x06,
    /// Notifies the device that it's being moved to a different address on the
    /// bus. Always an OUT.
    SetAddress = 0x05,
    /// Reads back the value passed to the last SET_CONFIGURATION, or 0 if
    /// unconfigured. Always an IN.
    GetConfiguration = 0x08,
    /// Configures a device by choosing one of the options listed in its
    /// descriptors. Always an OUT.
    SetConfiguration = 0x09,
    /// Reads back one interface's alternate setting. Always an IN, with the
    /// interface as recipient.
    GetInterface = 0x0A,
    /// Picks an alternate setting for one interface. Always an OUT, with
    /// the interface as recipient.
    SetInterface = 0x0B,
}

/// Recipient bits of `request_type` meaning "an interface."
pub const RECIPIENT_INTERFACE: u8 = 0x01;

/// Why a control request wasn't handled. In every case the request should be
/// stalled; nothing has been changed or sent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestError {
    /// Not a request we know how to answer.
    Unsupported { request_type: u8, request: u8 },
    /// `index` named an interface we don't have.
    NoSuchInterface(u16),
    /// `value` named an alternate setting the interface doesn't declare.
    NoSuchAlternate { interface: u8, alternate: u16 },
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported { request_type, request } => {
                write!(f, "unsupported request {request:#04x} (type {request_type:#04x})")
            }
            Self::NoSuchInterface(i) => write!(f, "no interface {i}"),
            Self::NoSuchAlternate { interface, alternate } => {
                write!(f, "interface {interface} has no alternate setting {alternate}")
            }
        }
    }
}

/// Currently selected alternate setting of each interface.
///
/// These are atomics so that the handler and the streaming engine can sit in
/// different execution contexts (say, an interrupt handler and the main loop)
/// without tearing. Today they don't, and only plain loads and stores are
/// used, which Cortex-M0 supports.
#[derive(Debug)]
pub struct InterfaceState {
    alternates: [AtomicU8; NUM_INTERFACES],
}

impl InterfaceState {
    pub const fn new() -> Self {
        // This is a hack for initializing an array with a
        // const-but-not-Copy expression.
        const ZERO: AtomicU8 = AtomicU8::new(0);
        Self {
            alternates: [ZERO; NUM_INTERFACES],
        }
    }

    /// Alternate setting of `interface`, or `None` if there's no such
    /// interface.
    pub fn alternate_setting(&self, interface: u8) -> Option<u8> {
        self.alternates
            .get(usize::from(interface))
            .map(|a| a.load(Ordering::Relaxed))
    }

    fn set(&self, interface: u8, alternate: u8) {
        self.alternates[usize::from(interface)].store(alternate, Ordering::Relaxed);
    }

    /// Puts every interface back on alternate setting 0.
    pub fn reset(&self) {
        for a in &self.alternates {
            a.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for InterfaceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles the control requests the generic EP0 dispatcher passes along.
#[derive(Debug, Default)]
pub struct ControlHandler {
    interfaces: InterfaceState,
}

impl ControlHandler {
    pub const fn new() -> Self {
        Self {
            interfaces: InterfaceState::new(),
        }
    }

    /// Interface state, for the streaming engine to read.
    pub fn interfaces(&self) -> &InterfaceState {
        &self.interfaces
    }

    /// Handles a host-to-device request. On success, the status stage (a
    /// zero-length packet on EP0 IN) has already been queued on `endpoints`.
    pub fn handle_out(
        &self,
        setup: &UsbSetupPacket,
        endpoints: &mut impl Endpoints,
    ) -> Result<(), RequestError> {
        let r = self.set_interface(setup);
        match r {
            Ok(()) => endpoints.ep_write(UsbDir::In.endpoint(0), &[]),
            Err(e) => warn!("{}", e),
        }
        r
    }

    fn set_interface(&self, setup: &UsbSetupPacket) -> Result<(), RequestError> {
        let is_set_interface = setup.request_type
            == (UsbDir::Out as u8 | RECIPIENT_INTERFACE)
            && UsbSetupRequest::from_u8(setup.request) == Some(UsbSetupRequest::SetInterface);
        if !is_set_interface {
            return Err(RequestError::Unsupported {
                request_type: setup.request_type,
                request: setup.request,
            });
        }

        let interface = interface_number(setup)?;

        let value = setup.value.get();
        let declared = alternate_settings(interface).unwrap_or(&[]);
        let alternate = u8::try_from(value)
            .ok()
            .filter(|a| declared.contains(a))
            .ok_or(RequestError::NoSuchAlternate {
                interface,
                alternate: value,
            })?;

        debug!("interface {} -> alternate setting {}", interface, alternate);
        self.interfaces.set(interface, alternate);
        Ok(())
    }

    /// Handles a device-to-host request aimed at one of our interfaces,
    /// returning the reply. GET_CUR on the mute control is not implemented,
    /// even though the feature unit descriptor advertises mute.
    pub fn handle_in(&self, setup: &UsbSetupPacket) -> Result<&'static [u8], RequestError> {
        let r = self.reply(setup);
        if let Err(e) = &r {
            warn!("{}", e);
        }
        r
    }

    fn reply(&self, setup: &UsbSetupPacket) -> Result<&'static [u8], RequestError> {
        let unsupported = RequestError::Unsupported {
            request_type: setup.request_type,
            request: setup.request,
        };
        if setup.request_type != (UsbDir::In as u8 | RECIPIENT_INTERFACE) {
            return Err(unsupported);
        }

        match UsbSetupRequest::from_u8(setup.request) {
            Some(UsbSetupRequest::GetInterface) => {
                let interface = interface_number(setup)?;
                let current = self.interfaces.alternate_setting(interface).unwrap_or(0);
                // The reply has to outlive this call, so point into the table
                // of declared settings rather than at a local.
                let declared = alternate_settings(interface).unwrap_or(&[]);
                let i = declared
                    .iter()
                    .position(|&a| a == current)
                    .ok_or(RequestError::NoSuchAlternate {
                        interface,
                        alternate: current.into(),
                    })?;
                Ok(&declared[i..=i])
            }
            Some(UsbSetupRequest::GetStatus) => {
                interface_number(setup)?;
                Ok(&[0, 0])
            }
            _ => Err(unsupported),
        }
    }

    /// Forgets all alternate settings. Call on bus reset and whenever the
    /// host (re)configures the device.
    pub fn reset(&self) {
        self.interfaces.reset();
    }
}

/// Interface named by a request's `index`, if we have it.
fn interface_number(setup: &UsbSetupPacket) -> Result<u8, RequestError> {
    let index = setup.index.get();
    u8::try_from(index)
        .ok()
        .filter(|&i| usize::from(i) < NUM_INTERFACES)
        .ok_or(RequestError::NoSuchInterface(index))
}

/// The data stage of a control IN transfer, doled out one EP0 packet at a
/// time.
///
/// Our configuration descriptor is bigger than one EP0 packet, so it goes out
/// in pieces: a full packet, then each time the host collects one, the next.
/// If the reply is shorter than the host asked for and ends exactly on a
/// packet boundary, a zero-length packet tells the host we're done.
#[derive(Debug, Default)]
pub struct DataStage {
    rest: &'static [u8],
    zlp: bool,
}

impl DataStage {
    /// Prepares to send `data` in reply to a request for `requested` bytes.
    pub fn new(data: &'static [u8], requested: u16) -> Self {
        let data = &data[..data.len().min(usize::from(requested))];
        Self {
            rest: data,
            zlp: data.len() < usize::from(requested)
                && data.len() % usize::from(EP0_MAX_PACKET_SIZE) == 0,
        }
    }

    /// Returns the next packet to send, or `None` once everything, including
    /// any terminating zero-length packet, has been handed out.
    pub fn next_packet(&mut self) -> Option<&'static [u8]> {
        if !self.rest.is_empty() {
            let n = self.rest.len().min(usize::from(EP0_MAX_PACKET_SIZE));
            let (packet, rest) = self.rest.split_at(n);
            self.rest = rest;
            Some(packet)
        } else if self.zlp {
            self.zlp = false;
            Some(&[])
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UsbTransferType;

    #[derive(Default)]
    struct Recorder {
        writes: Vec<(u8, Vec<u8>)>,
    }

    impl Endpoints for Recorder {
        fn ep_init(&mut self, _: u8, _: UsbTransferType, _: u16) {}

        fn ep_write(&mut self, address: u8, data: &[u8]) {
            self.writes.push((address, data.to_vec()));
        }
    }

    fn setup(request_type: u8, request: u8, value: u16, index: u16) -> UsbSetupPacket {
        UsbSetupPacket {
            request_type,
            request,
            value: U16::new(value),
            index: U16::new(index),
            length: U16::new(0),
        }
    }

    #[test]
    fn set_interface_stores_alternate_and_acks() {
        let h = ControlHandler::new();
        let mut ep = Recorder::default();
        assert_eq!(h.handle_out(&setup(0x01, 0x0B, 1, 1), &mut ep), Ok(()));
        assert_eq!(h.interfaces().alternate_setting(1), Some(1));
        assert_eq!(h.interfaces().alternate_setting(0), Some(0));
        assert_eq!(ep.writes, vec![(0x80, vec![])]);
    }

    #[test]
    fn setting_back_to_zero_works() {
        let h = ControlHandler::new();
        let mut ep = Recorder::default();
        h.handle_out(&setup(0x01, 0x0B, 1, 1), &mut ep).unwrap();
        h.handle_out(&setup(0x01, 0x0B, 0, 1), &mut ep).unwrap();
        assert_eq!(h.interfaces().alternate_setting(1), Some(0));
        assert_eq!(ep.writes.len(), 2);
    }

    #[test]
    fn other_requests_are_not_handled() {
        let h = ControlHandler::new();
        let mut ep = Recorder::default();
        let cases = [
            // SET_CUR on an interface (class request).
            (0x21, 0x01),
            // SET_INTERFACE with the wrong recipient.
            (0x00, 0x0B),
            (0x02, 0x0B),
            // Standard interface request that isn't SET_INTERFACE.
            (0x01, 0x03),
            // IN direction.
            (0x81, 0x0B),
        ];
        for (request_type, request) in cases {
            assert_eq!(
                h.handle_out(&setup(request_type, request, 1, 1), &mut ep),
                Err(RequestError::Unsupported { request_type, request }),
            );
        }
        assert!(ep.writes.is_empty());
        assert_eq!(h.interfaces().alternate_setting(1), Some(0));
    }

    #[test]
    fn bad_interface_or_alternate_is_rejected_without_change() {
        let h = ControlHandler::new();
        let mut ep = Recorder::default();
        assert_eq!(
            h.handle_out(&setup(0x01, 0x0B, 1, 2), &mut ep),
            Err(RequestError::NoSuchInterface(2)),
        );
        assert_eq!(
            h.handle_out(&setup(0x01, 0x0B, 1, 0x100), &mut ep),
            Err(RequestError::NoSuchInterface(0x100)),
        );
        assert_eq!(
            h.handle_out(&setup(0x01, 0x0B, 2, 1), &mut ep),
            Err(RequestError::NoSuchAlternate { interface: 1, alternate: 2 }),
        );
        assert_eq!(
            h.handle_out(&setup(0x01, 0x0B, 1, 0), &mut ep),
            Err(RequestError::NoSuchAlternate { interface: 0, alternate: 1 }),
        );
        assert!(ep.writes.is_empty());
        assert_eq!(h.interfaces().alternate_setting(0), Some(0));
        assert_eq!(h.interfaces().alternate_setting(1), Some(0));
    }

    #[test]
    fn in_requests_are_not_handled() {
        let h = ControlHandler::new();
        // GET_CUR, mute control, master channel, feature unit 2.
        let get_mute = setup(0xA1, 0x81, 0x0100, 0x0200);
        assert!(matches!(h.handle_in(&get_mute), Err(RequestError::Unsupported { .. })));
    }

    #[test]
    fn get_interface_reports_current_alternate() {
        let h = ControlHandler::new();
        let mut ep = Recorder::default();
        let get = setup(0x81, 0x0A, 0, 1);
        assert_eq!(h.handle_in(&get), Ok(&[0][..]));
        h.handle_out(&setup(0x01, 0x0B, 1, 1), &mut ep).unwrap();
        assert_eq!(h.handle_in(&get), Ok(&[1][..]));
        assert_eq!(h.handle_in(&setup(0x81, 0x0A, 0, 0)), Ok(&[0][..]));
    }

    #[test]
    fn get_interface_on_missing_interface_is_rejected() {
        let h = ControlHandler::new();
        assert_eq!(
            h.handle_in(&setup(0x81, 0x0A, 0, 2)),
            Err(RequestError::NoSuchInterface(2)),
        );
    }

    #[test]
    fn interface_status_is_two_zero_bytes() {
        let h = ControlHandler::new();
        assert_eq!(h.handle_in(&setup(0x81, 0x00, 0, 1)), Ok(&[0, 0][..]));
        assert_eq!(
            h.handle_in(&setup(0x81, 0x00, 0, 5)),
            Err(RequestError::NoSuchInterface(5)),
        );
        // Device and endpoint status aren't ours to answer.
        assert!(h.handle_in(&setup(0x80, 0x00, 0, 0)).is_err());
        assert!(h.handle_in(&setup(0x82, 0x00, 0, 0x82)).is_err());
    }

    #[test]
    fn reset_returns_to_idle() {
        let h = ControlHandler::new();
        let mut ep = Recorder::default();
        h.handle_out(&setup(0x01, 0x0B, 1, 1), &mut ep).unwrap();
        h.reset();
        assert_eq!(h.interfaces().alternate_setting(1), Some(0));
        assert_eq!(h.interfaces().alternate_setting(7), None);
    }

    #[test]
    fn setup_packet_parses_little_endian() {
        let raw = [0x01, 0x0B, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00];
        let p = zerocopy::LayoutVerified::<_, UsbSetupPacket>::new(&raw[..])
            .unwrap()
            .into_ref();
        assert_eq!(p.request, 0x0B);
        assert_eq!(p.value.get(), 1);
        assert_eq!(p.index.get(), 1);
    }

    #[test]
    fn errors_display() {
        let e = RequestError::NoSuchAlternate { interface: 1, alternate: 5 };
        assert_eq!(e.to_string(), "interface 1 has no alternate setting 5");
    }

    static BYTES: [u8; 160] = {
        let mut b = [0; 160];
        let mut i = 0;
        while i < b.len() {
            b[i] = i as u8;
            i += 1;
        }
        b
    };

    fn packets(mut d: DataStage) -> Vec<usize> {
        let mut out = vec![];
        while let Some(p) = d.next_packet() {
            out.push(p.len());
        }
        out
    }

    #[test]
    fn data_stage_splits_into_ep0_packets() {
        assert_eq!(packets(DataStage::new(&BYTES[..118], 0xFF)), vec![64, 54]);
        assert_eq!(packets(DataStage::new(&BYTES[..18], 64)), vec![18]);
        let mut d = DataStage::new(&BYTES[..118], 0xFF);
        assert_eq!(d.next_packet(), Some(&BYTES[..64]));
        assert_eq!(d.next_packet(), Some(&BYTES[64..118]));
        assert_eq!(d.next_packet(), None);
    }

    #[test]
    fn data_stage_truncates_to_request() {
        assert_eq!(packets(DataStage::new(&BYTES[..118], 9)), vec![9]);
        assert_eq!(packets(DataStage::new(&BYTES[..18], 8)), vec![8]);
    }

    #[test]
    fn data_stage_ends_short_replies_on_packet_boundary_with_zlp() {
        assert_eq!(packets(DataStage::new(&BYTES[..128], 0xFF)), vec![64, 64, 0]);
        // Exactly what was asked for: no ZLP needed.
        assert_eq!(packets(DataStage::new(&BYTES[..128], 128)), vec![64, 64]);
        assert_eq!(packets(DataStage::new(&BYTES[..160], 64)), vec![64]);
    }

    #[test]
    fn empty_data_stage_sends_nothing() {
        assert_eq!(packets(DataStage::default()), Vec::<usize>::new());
    }
}
