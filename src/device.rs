// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The descriptors of our device, as static data.
//!
//! The configuration descriptor is the tricky one, because USB wants it
//! delivered as one long concatenation of smaller descriptors, with the total
//! length written near the front. Rather than keeping a byte array and a
//! length constant in sync by hand, `AudioConfiguration` is a single
//! `#[repr(C)]` struct whose fields _are_ the concatenation, in wire order.
//! Its total length is then just `size_of::<AudioConfiguration>()`, which the
//! compiler works out for us. The audio control header's length field gets
//! the same treatment via `AudioControlBlock`.
//!
//! Adding a descriptor means adding a field; the lengths follow on their own.

use core::mem::size_of;

use zerocopy::{AsBytes, Unaligned};

use crate::descriptor::*;
use crate::{
    AUDIO_CONTROL_INTERFACE, AUDIO_IN_ADDR, AUDIO_IN_MAX_PACKET_SIZE,
    AUDIO_STREAMING_INTERFACE, BIT_RESOLUTION, CHANNELS, EP0_MAX_PACKET_SIZE,
    NUM_INTERFACES, SAMPLE_RATE, STREAMING_ALT_ACTIVE, STREAMING_ALT_IDLE,
    SUBFRAME_SIZE,
};

pub const USB_VID: u16 = 0x16C0;
pub const USB_PID: u16 = 0x05DF;
pub const NUM_CONFIGURATIONS: u8 = 1;

/// String descriptor indices.
pub const STRING_LANGUAGE: u8 = 0;
pub const STRING_MANUFACTURER: u8 = 1;
pub const STRING_PRODUCT: u8 = 2;
pub const STRING_SERIAL: u8 = 3;

/// Audio topology IDs. Sources must name something defined earlier.
pub const INPUT_TERMINAL_ID: u8 = 1;
pub const FEATURE_UNIT_ID: u8 = 2;
pub const OUTPUT_TERMINAL_ID: u8 = 3;

/// The class-specific part of the audio control interface: header, then the
/// microphone -> mute -> USB chain.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct AudioControlBlock {
    pub header: AcHeaderDescriptor,
    pub input_terminal: InputTerminalDescriptor,
    pub feature_unit: FeatureUnitDescriptor,
    pub output_terminal: OutputTerminalDescriptor,
}

/// Everything returned for a configuration descriptor request, in the order
/// it goes over the wire.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct AudioConfiguration {
    pub config: UsbConfigurationDescriptor,
    pub control_interface: UsbInterfaceDescriptor,
    pub control: AudioControlBlock,
    /// Streaming interface, alternate 0: no endpoints, no bandwidth.
    pub streaming_idle: UsbInterfaceDescriptor,
    /// Streaming interface, alternate 1: the isochronous endpoint.
    pub streaming_active: UsbInterfaceDescriptor,
    pub streaming_general: AsGeneralDescriptor,
    pub format: FormatTypeIDescriptor,
    pub endpoint: AudioEndpointDescriptor,
    pub endpoint_general: AudioDataEndpointDescriptor,
}

// Descriptor lengths are one byte, and the totals are two.
const _: () = assert!(size_of::<AudioControlBlock>() <= u16::MAX as usize);
const _: () = assert!(size_of::<AudioConfiguration>() <= u16::MAX as usize);

pub static DEVICE_DESCRIPTOR: UsbDeviceDescriptor = UsbDeviceDescriptor {
    length: size_of::<UsbDeviceDescriptor>() as u8,
    descriptor_type: UsbDescType::Device,
    bcd_usb: le16(0x0110),
    device_class: 0,
    device_subclass: 0,
    device_protocol: 0,
    max_packet_size0: EP0_MAX_PACKET_SIZE,
    vendor: le16(USB_VID),
    product: le16(USB_PID),
    bcd_device: le16(0x0001),
    manufacturer_s: STRING_MANUFACTURER,
    product_s: STRING_PRODUCT,
    serial_s: STRING_SERIAL,
    num_configurations: NUM_CONFIGURATIONS,
};

pub static DEVICE_QUALIFIER: UsbDeviceQualifierDescriptor = UsbDeviceQualifierDescriptor {
    length: size_of::<UsbDeviceQualifierDescriptor>() as u8,
    descriptor_type: UsbDescType::DeviceQualifier,
    bcd_usb: le16(0x0200),
    device_class: 0,
    device_subclass: 0,
    device_protocol: 0,
    max_packet_size0: EP0_MAX_PACKET_SIZE,
    num_configurations: NUM_CONFIGURATIONS,
    reserved: 0,
};

pub static CONFIGURATION: AudioConfiguration = AudioConfiguration {
    config: UsbConfigurationDescriptor {
        length: size_of::<UsbConfigurationDescriptor>() as u8,
        descriptor_type: UsbDescType::Config,
        total_length: le16(size_of::<AudioConfiguration>() as u16),
        num_interfaces: NUM_INTERFACES as u8,
        configuration_value: 1,
        configuration_s: 0,
        // Bus powered.
        attributes: 0x80,
        // 100 mA.
        max_power: 0x32,
    },
    control_interface: UsbInterfaceDescriptor {
        length: size_of::<UsbInterfaceDescriptor>() as u8,
        descriptor_type: UsbDescType::Interface,
        interface_number: AUDIO_CONTROL_INTERFACE,
        alternate_setting: 0,
        // Would be 1 if we had an interrupt endpoint for status changes.
        num_endpoints: 0,
        interface_class: CLASS_AUDIO,
        interface_subclass: SUBCLASS_AUDIOCONTROL,
        interface_protocol: 0,
        interface_s: 0,
    },
    control: AudioControlBlock {
        header: AcHeaderDescriptor {
            length: size_of::<AcHeaderDescriptor>() as u8,
            descriptor_type: UsbDescType::CsInterface,
            descriptor_subtype: AC_HEADER,
            bcd_adc: le16(0x0100),
            total_length: le16(size_of::<AudioControlBlock>() as u16),
            in_collection: 1,
            interface_nr: [AUDIO_STREAMING_INTERFACE],
        },
        input_terminal: InputTerminalDescriptor {
            length: size_of::<InputTerminalDescriptor>() as u8,
            descriptor_type: UsbDescType::CsInterface,
            descriptor_subtype: AC_INPUT_TERMINAL,
            terminal_id: INPUT_TERMINAL_ID,
            terminal_type: le16(TERMINAL_MICROPHONE),
            assoc_terminal: 0,
            nr_channels: CHANNELS as u8,
            channel_config: le16(0),
            channel_names: 0,
            terminal_s: 0,
        },
        feature_unit: FeatureUnitDescriptor {
            length: size_of::<FeatureUnitDescriptor>() as u8,
            descriptor_type: UsbDescType::CsInterface,
            descriptor_subtype: AC_FEATURE_UNIT,
            unit_id: FEATURE_UNIT_ID,
            source_id: INPUT_TERMINAL_ID,
            control_size: 1,
            // UAC 1.0 sizes bmaControls as (channels + 1) * bControlSize: one
            // byte for the master channel, then one per logical channel, even
            // when those have no controls. Mute on the master channel only.
            controls: {
                let mut c = [0; 1 + CHANNELS];
                c[0] = FEATURE_MUTE;
                c
            },
            feature_s: 0,
        },
        output_terminal: OutputTerminalDescriptor {
            length: size_of::<OutputTerminalDescriptor>() as u8,
            descriptor_type: UsbDescType::CsInterface,
            descriptor_subtype: AC_OUTPUT_TERMINAL,
            terminal_id: OUTPUT_TERMINAL_ID,
            terminal_type: le16(TERMINAL_USB_STREAMING),
            assoc_terminal: 0,
            source_id: FEATURE_UNIT_ID,
            terminal_s: 0,
        },
    },
    streaming_idle: UsbInterfaceDescriptor {
        length: size_of::<UsbInterfaceDescriptor>() as u8,
        descriptor_type: UsbDescType::Interface,
        interface_number: AUDIO_STREAMING_INTERFACE,
        alternate_setting: STREAMING_ALT_IDLE,
        num_endpoints: 0,
        interface_class: CLASS_AUDIO,
        interface_subclass: SUBCLASS_AUDIOSTREAMING,
        interface_protocol: 0,
        interface_s: 0,
    },
    streaming_active: UsbInterfaceDescriptor {
        length: size_of::<UsbInterfaceDescriptor>() as u8,
        descriptor_type: UsbDescType::Interface,
        interface_number: AUDIO_STREAMING_INTERFACE,
        alternate_setting: STREAMING_ALT_ACTIVE,
        num_endpoints: 1,
        interface_class: CLASS_AUDIO,
        interface_subclass: SUBCLASS_AUDIOSTREAMING,
        interface_protocol: 0,
        interface_s: 0,
    },
    streaming_general: AsGeneralDescriptor {
        length: size_of::<AsGeneralDescriptor>() as u8,
        descriptor_type: UsbDescType::CsInterface,
        descriptor_subtype: AS_GENERAL,
        terminal_link: OUTPUT_TERMINAL_ID,
        delay: 1,
        format_tag: le16(FORMAT_PCM),
    },
    format: FormatTypeIDescriptor {
        length: size_of::<FormatTypeIDescriptor>() as u8,
        descriptor_type: UsbDescType::CsInterface,
        descriptor_subtype: AS_FORMAT_TYPE,
        format_type: FORMAT_TYPE_I,
        nr_channels: CHANNELS as u8,
        subframe_size: SUBFRAME_SIZE as u8,
        bit_resolution: BIT_RESOLUTION,
        sam_freq_type: 1,
        sam_freq: sample_rate_bytes(SAMPLE_RATE),
    },
    endpoint: AudioEndpointDescriptor {
        length: size_of::<AudioEndpointDescriptor>() as u8,
        descriptor_type: UsbDescType::Endpoint,
        endpoint_address: AUDIO_IN_ADDR,
        // Isochronous, no synchronization, data endpoint.
        attributes: UsbTransferType::Isochronous as u8,
        max_packet_size: le16(AUDIO_IN_MAX_PACKET_SIZE),
        interval: 1,
        refresh: 0,
        synch_address: 0,
    },
    endpoint_general: AudioDataEndpointDescriptor {
        length: size_of::<AudioDataEndpointDescriptor>() as u8,
        descriptor_type: UsbDescType::CsEndpoint,
        descriptor_subtype: EP_GENERAL,
        attributes: 0,
        lock_delay_units: 0,
        lock_delay: le16(0),
    },
};

pub static LANG_DESCRIPTOR: [u8; 4] = [4, UsbDescType::String as u8, 0x09, 0x04];
pub static MANUFACTURER_DESCRIPTOR: [u8; string_descriptor_len("Raspberry Pi")] =
    crate::usb_string!("Raspberry Pi");
pub static PRODUCT_DESCRIPTOR: [u8; string_descriptor_len("Pico USB Audio")] =
    crate::usb_string!("Pico USB Audio");
pub static SERIAL_DESCRIPTOR: [u8; string_descriptor_len("1")] = crate::usb_string!("1");

/// Alternate settings the descriptors above declare for `interface`, or
/// `None` if there's no such interface.
pub fn alternate_settings(interface: u8) -> Option<&'static [u8]> {
    match interface {
        AUDIO_CONTROL_INTERFACE => Some(&[0]),
        AUDIO_STREAMING_INTERFACE => Some(&[STREAMING_ALT_IDLE, STREAMING_ALT_ACTIVE]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Walks a run of concatenated descriptors by their `bLength` bytes,
    /// returning each one.
    fn walk(mut bytes: &[u8]) -> Vec<&[u8]> {
        let mut out = vec![];
        while !bytes.is_empty() {
            let len = usize::from(bytes[0]);
            assert!(len >= 2, "zero-length descriptor would loop forever");
            assert!(len <= bytes.len(), "descriptor runs off the end");
            out.push(&bytes[..len]);
            bytes = &bytes[len..];
        }
        out
    }

    #[test]
    fn configuration_total_length_matches_content() {
        let bytes = CONFIGURATION.as_bytes();
        assert_eq!(usize::from(CONFIGURATION.config.total_length.get()), bytes.len());
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]) as usize, bytes.len());
        let members = walk(bytes);
        assert_eq!(members.iter().map(|d| d.len()).sum::<usize>(), bytes.len());
        assert_eq!(members.len(), 12);
    }

    #[test]
    fn audio_control_total_length_matches_content() {
        let bytes = CONFIGURATION.control.as_bytes();
        assert_eq!(usize::from(CONFIGURATION.control.header.total_length.get()), bytes.len());
        // Header, input terminal, feature unit, output terminal.
        let members = walk(bytes);
        assert_eq!(members.len(), 4);
        assert!(members.iter().all(|d| d[1] == UsbDescType::CsInterface as u8));
    }

    #[test]
    fn topology_links_point_backwards() {
        let c = &CONFIGURATION.control;
        assert_eq!(c.output_terminal.source_id, c.feature_unit.unit_id);
        assert_eq!(c.feature_unit.source_id, c.input_terminal.terminal_id);
        let ids = [c.input_terminal.terminal_id, c.feature_unit.unit_id, c.output_terminal.terminal_id];
        assert!(ids[0] < ids[1] && ids[1] < ids[2]);
        assert_eq!(CONFIGURATION.streaming_general.terminal_link, c.output_terminal.terminal_id);
    }

    #[test]
    fn feature_unit_advertises_master_mute_only() {
        let fu = &CONFIGURATION.control.feature_unit;
        assert_eq!(fu.control_size, 1);
        assert_eq!(fu.controls[0], FEATURE_MUTE);
        assert!(fu.controls[1..].iter().all(|&c| c == 0));
        assert_eq!(usize::from(fu.length), 7 + fu.controls.len());
    }

    #[test]
    fn feature_unit_has_a_control_entry_per_channel_plus_master() {
        let fu = &CONFIGURATION.control.feature_unit;
        let nr_channels = usize::from(CONFIGURATION.control.input_terminal.nr_channels);
        assert_eq!(fu.controls.len(), (nr_channels + 1) * usize::from(fu.control_size));
        let bytes = fu.as_bytes();
        assert_eq!(bytes.len(), 10);
        assert_eq!(&bytes[6..9], &[FEATURE_MUTE, 0, 0]);
    }

    #[test]
    fn interface_and_endpoint_counts_agree() {
        let bytes = CONFIGURATION.as_bytes();
        let members = walk(bytes);
        let interfaces: Vec<_> = members
            .iter()
            .filter(|d| d[1] == UsbDescType::Interface as u8)
            .collect();
        assert_eq!(interfaces.len(), 3);
        let mut numbers: Vec<u8> = interfaces.iter().map(|d| d[2]).collect();
        numbers.dedup();
        assert_eq!(usize::from(CONFIGURATION.config.num_interfaces), numbers.len());

        let endpoints = members
            .iter()
            .filter(|d| d[1] == UsbDescType::Endpoint as u8)
            .count();
        let declared: usize = interfaces.iter().map(|d| usize::from(d[4])).sum();
        assert_eq!(endpoints, declared);
    }

    #[test]
    fn streaming_alternates() {
        assert_eq!(CONFIGURATION.streaming_idle.num_endpoints, 0);
        assert_eq!(CONFIGURATION.streaming_active.num_endpoints, 1);
        assert_eq!(
            CONFIGURATION.streaming_idle.interface_number,
            CONFIGURATION.streaming_active.interface_number,
        );
        assert_eq!(CONFIGURATION.control.header.interface_nr, [AUDIO_STREAMING_INTERFACE]);
    }

    #[test]
    fn format_and_endpoint_agree() {
        let f = &CONFIGURATION.format;
        assert_eq!(f.sam_freq, [0x80, 0xBB, 0x00]);
        assert_eq!(usize::from(f.subframe_size) * 8, usize::from(f.bit_resolution));
        let per_ms = SAMPLE_RATE as usize / 1000 * usize::from(f.nr_channels) * usize::from(f.subframe_size);
        assert!(per_ms <= usize::from(CONFIGURATION.endpoint.max_packet_size.get()));
        assert_eq!(CONFIGURATION.endpoint.endpoint_address, 0x82);
        assert_eq!(CONFIGURATION.endpoint.attributes, 0x01);
        assert_eq!(CONFIGURATION.endpoint.interval, 1);
    }

    #[test]
    fn qualifier_mirrors_device() {
        assert_eq!(DEVICE_QUALIFIER.max_packet_size0, DEVICE_DESCRIPTOR.max_packet_size0);
        assert_eq!(DEVICE_QUALIFIER.num_configurations, DEVICE_DESCRIPTOR.num_configurations);
        assert_eq!(DEVICE_QUALIFIER.as_bytes().len(), 10);
    }

    #[test]
    fn device_descriptor_bytes() {
        assert_eq!(
            DEVICE_DESCRIPTOR.as_bytes(),
            &[18, 0x01, 0x10, 0x01, 0, 0, 0, 64, 0xC0, 0x16, 0xDF, 0x05, 0x01, 0x00, 1, 2, 3, 1],
        );
    }
}
