// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Plays the host's side of enumeration and streaming against the library,
//! with a fake transport standing in for the USB controller.

use rp2040_uac::descriptor::UsbDescType;
use rp2040_uac::{
    resolve, ControlHandler, Endpoints, StreamingEngine, UsbSetupPacket, UsbTransferType,
    AUDIO_IN_ADDR, FRAME_BYTES,
};
use zerocopy::LayoutVerified;

#[derive(Default)]
struct FakeTransport {
    inits: Vec<(u8, UsbTransferType, u16)>,
    writes: Vec<(u8, Vec<u8>)>,
}

impl Endpoints for FakeTransport {
    fn ep_init(&mut self, address: u8, kind: UsbTransferType, max_packet_size: u16) {
        self.inits.push((address, kind, max_packet_size));
    }

    fn ep_write(&mut self, address: u8, data: &[u8]) {
        self.writes.push((address, data.to_vec()));
    }
}

impl FakeTransport {
    fn audio_writes(&self) -> Vec<&[u8]> {
        self.writes
            .iter()
            .filter(|(a, _)| *a == AUDIO_IN_ADDR)
            .map(|(_, d)| &d[..])
            .collect()
    }
}

fn get_descriptor(ty: UsbDescType, index: u8) -> Option<&'static [u8]> {
    resolve((ty as u16) << 8 | u16::from(index))
}

fn set_interface(interface: u16, alternate: u16) -> [u8; 8] {
    let mut raw = [0x01, 0x0B, 0, 0, 0, 0, 0, 0];
    raw[2..4].copy_from_slice(&alternate.to_le_bytes());
    raw[4..6].copy_from_slice(&interface.to_le_bytes());
    raw
}

fn parse_setup(raw: &[u8; 8]) -> &UsbSetupPacket {
    LayoutVerified::<_, UsbSetupPacket>::new(&raw[..])
        .unwrap()
        .into_ref()
}

/// Pulls (interface, alternate, endpoint count) out of each interface
/// descriptor, plus the addresses of all endpoint descriptors.
fn survey(config: &[u8]) -> (Vec<(u8, u8, u8)>, Vec<u8>) {
    let mut interfaces = vec![];
    let mut endpoints = vec![];
    let mut rest = config;
    while !rest.is_empty() {
        let len = usize::from(rest[0]);
        assert!(len >= 2 && len <= rest.len());
        match rest[1] {
            0x04 => interfaces.push((rest[2], rest[3], rest[4])),
            0x05 => endpoints.push(rest[2]),
            _ => (),
        }
        rest = &rest[len..];
    }
    (interfaces, endpoints)
}

#[test]
fn enumerate_then_stream() {
    let handler = ControlHandler::new();
    let mut engine = StreamingEngine::new();
    let mut transport = FakeTransport::default();
    engine.init(&mut transport);
    assert_eq!(
        transport.inits,
        vec![(AUDIO_IN_ADDR, UsbTransferType::Isochronous, 256)],
    );

    // Device first. Hosts often ask for just 8 bytes to learn EP0's size.
    let device = get_descriptor(UsbDescType::Device, 0).unwrap();
    assert_eq!(device[0], 18);
    assert_eq!(device.len(), 18);
    assert_eq!(device[7], 64);

    // Then the configuration header, to learn the total length...
    let config = get_descriptor(UsbDescType::Config, 0).unwrap();
    let header = &config[..9];
    let total = usize::from(u16::from_le_bytes([header[2], header[3]]));
    // ...and then the whole thing, which had better be exactly that long.
    assert_eq!(config.len(), total);

    let (interfaces, endpoints) = survey(config);
    assert_eq!(interfaces, vec![(0, 0, 0), (1, 0, 0), (1, 1, 1)]);
    assert_eq!(endpoints, vec![AUDIO_IN_ADDR]);
    assert_eq!(usize::from(config[4]), 2);

    // Strings named by the device descriptor all exist.
    for &i in &device[14..17] {
        let s = get_descriptor(UsbDescType::String, i).unwrap();
        assert_eq!(usize::from(s[0]), s.len());
    }
    assert!(get_descriptor(UsbDescType::String, 4).is_none());

    // Nothing is sent before the host picks the streaming alternate.
    engine.sync(handler.interfaces(), &mut transport);
    assert!(transport.writes.is_empty());

    // Start streaming.
    handler
        .handle_out(parse_setup(&set_interface(1, 1)), &mut transport)
        .unwrap();
    assert_eq!(transport.writes, vec![(0x80, vec![])]);
    assert_eq!(handler.interfaces().alternate_setting(1), Some(1));
    engine.sync(handler.interfaces(), &mut transport);

    for _ in 0..10 {
        assert!(engine.on_complete(handler.interfaces(), &mut transport));
    }

    let frames = transport.audio_writes();
    // One priming write plus ten completions.
    assert_eq!(frames.len(), 11);
    for f in &frames {
        assert_eq!(f.len(), FRAME_BYTES);
    }
    let positive = &engine.positive()[..];
    let positive: Vec<u8> = positive.iter().flat_map(|s| s.get().to_le_bytes()).collect();
    let negative: Vec<u8> = engine.negative().iter().flat_map(|s| s.get().to_le_bytes()).collect();
    for (n, f) in frames.iter().enumerate() {
        let expected = if n % 2 == 0 { &positive } else { &negative };
        assert_eq!(*f, &expected[..], "frame {} out of order", n);
    }

    // Stop streaming: the next completion sends nothing.
    handler
        .handle_out(parse_setup(&set_interface(1, 0)), &mut transport)
        .unwrap();
    engine.sync(handler.interfaces(), &mut transport);
    assert!(!engine.is_armed());
    assert!(!engine.on_complete(handler.interfaces(), &mut transport));
    assert_eq!(transport.audio_writes().len(), 11);
}

#[test]
fn unknown_requests_produce_nothing() {
    let handler = ControlHandler::new();
    let mut transport = FakeTransport::default();

    // SET_CUR on the feature unit's mute control.
    let set_mute = [0x21, 0x01, 0x00, 0x01, 0x00, 0x02, 0x01, 0x00];
    assert!(handler
        .handle_out(parse_setup(&set_mute), &mut transport)
        .is_err());
    // GET_CUR on the same.
    let get_mute = [0xA1, 0x81, 0x00, 0x01, 0x00, 0x02, 0x01, 0x00];
    assert!(handler.handle_in(parse_setup(&get_mute)).is_err());

    assert!(transport.writes.is_empty());
    assert_eq!(handler.interfaces().alternate_setting(1), Some(0));
}

#[test]
fn bus_reset_stops_the_stream() {
    let handler = ControlHandler::new();
    let mut engine = StreamingEngine::new();
    let mut transport = FakeTransport::default();

    handler
        .handle_out(parse_setup(&set_interface(1, 1)), &mut transport)
        .unwrap();
    engine.sync(handler.interfaces(), &mut transport);
    assert!(engine.is_armed());

    // What the firmware does when it sees a bus reset, after dropping the
    // audio endpoint's pending buffer.
    handler.reset();
    engine.reset();
    assert!(!engine.is_in_flight());

    assert!(!engine.on_complete(handler.interfaces(), &mut transport));
    assert_eq!(transport.audio_writes().len(), 1);
    assert_eq!(handler.interfaces().alternate_setting(1), Some(0));
}

#[test]
fn restarting_the_stream_leaves_the_pending_frame_alone() {
    let handler = ControlHandler::new();
    let mut engine = StreamingEngine::new();
    let mut transport = FakeTransport::default();

    // On, off, on again, and the host never collected anything.
    for alternate in [1, 0, 1] {
        handler
            .handle_out(parse_setup(&set_interface(1, alternate)), &mut transport)
            .unwrap();
        engine.sync(handler.interfaces(), &mut transport);
    }

    assert!(engine.is_armed());
    assert_eq!(transport.audio_writes().len(), 1);
}
