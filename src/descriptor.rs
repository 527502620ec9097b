// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB and USB Audio 1.0 descriptor layouts.
//!
//! Each descriptor is a `#[repr(C)]` struct made only of bytes and
//! little-endian wrapped integers, so it has alignment 1, no padding, and
//! `zerocopy` can hand out its bytes exactly as they go on the wire. The
//! actual descriptor _values_ for this device are over in `device`.

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use zerocopy::{AsBytes, Unaligned, U16};

/// Produces a little-endian `u16` field in a `const` context.
pub const fn le16(x: u16) -> U16<LittleEndian> {
    U16::from_bytes(x.to_le_bytes())
}

/// Audio Class 1.0 encodes sample rates in 3 bytes, not the 4 you'd expect.
pub const fn sample_rate_bytes(hz: u32) -> [u8; 3] {
    let b = hz.to_le_bytes();
    [b[0], b[1], b[2]]
}

/// USB deals in two different transfer directions, called OUT (host-to-device)
/// and IN (device-to-host). In the vast majority of cases, OUT is represented
/// by a 0 byte, and IN by an `0x80` byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum UsbDir {
    Out = 0,
    In = 0x80,
}

impl UsbDir {
    pub const fn endpoint(self, num: u8) -> u8 {
        num | self as u8
    }

    pub const fn of_endpoint_addr(addr: u8) -> Self {
        if addr & Self::In as u8 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }
}

/// Types of USB descriptor, including the two class-specific ones the audio
/// class uses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, AsBytes, Unaligned)]
#[repr(u8)]
pub enum UsbDescType {
    Device = 0x01,
    Config = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    DeviceQualifier = 0x06,
    CsInterface = 0x24,
    CsEndpoint = 0x25,
}

/// Types of transfer that can be indicated by the `attributes` field on an
/// endpoint descriptor. Isochronous endpoints also carry synchronization and
/// usage bits above these; we always leave those zero (no sync, data).
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum UsbTransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Interface class code for audio.
pub const CLASS_AUDIO: u8 = 0x01;
/// Audio interface subclasses.
pub const SUBCLASS_AUDIOCONTROL: u8 = 0x01;
pub const SUBCLASS_AUDIOSTREAMING: u8 = 0x02;

/// Descriptor subtypes inside an audio control interface.
pub const AC_HEADER: u8 = 0x01;
pub const AC_INPUT_TERMINAL: u8 = 0x02;
pub const AC_OUTPUT_TERMINAL: u8 = 0x03;
pub const AC_FEATURE_UNIT: u8 = 0x06;

/// Descriptor subtypes inside an audio streaming interface.
pub const AS_GENERAL: u8 = 0x01;
pub const AS_FORMAT_TYPE: u8 = 0x02;

/// Subtype of the class-specific isochronous endpoint descriptor.
pub const EP_GENERAL: u8 = 0x01;

pub const FORMAT_TYPE_I: u8 = 0x01;
pub const FORMAT_PCM: u16 = 0x0001;

/// Terminal types from the USB Audio Terminal Types document.
pub const TERMINAL_USB_STREAMING: u16 = 0x0101;
pub const TERMINAL_MICROPHONE: u16 = 0x0201;

/// Feature unit control bits, as found in `bmaControls`.
pub const FEATURE_MUTE: u8 = 0x01;

/// Describes a device. This is the most broad description in USB and is
/// typically the first thing the host asks for.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct UsbDeviceDescriptor {
    /// Length of this structure, must be 18.
    pub length: u8,
    /// Type of this descriptor, must be `Device`.
    pub descriptor_type: UsbDescType,
    /// Version of the device descriptor / USB protocol, in binary-coded
    /// decimal. This is typically `0x01_10` for USB 1.1.
    pub bcd_usb: U16<LittleEndian>,
    /// Class of device, giving a broad functional area. Zero means "see the
    /// interfaces," which is what audio devices do.
    pub device_class: u8,
    /// Subclass of device, refining the class.
    pub device_subclass: u8,
    /// Protocol within the subclass.
    pub device_protocol: u8,
    /// Maximum unit of data this device can move on EP0.
    pub max_packet_size0: u8,
    /// ID of product vendor.
    pub vendor: U16<LittleEndian>,
    /// ID of product.
    pub product: U16<LittleEndian>,
    /// Device version number, as BCD again.
    pub bcd_device: U16<LittleEndian>,
    /// Index of manufacturer name in string descriptor table.
    pub manufacturer_s: u8,
    /// Index of product name in string descriptor table.
    pub product_s: u8,
    /// Index of serial number in string descriptor table.
    pub serial_s: u8,
    /// Number of configurations supported by this device.
    pub num_configurations: u8,
}

/// Describes how the device would look at the "other" speed. Hosts ask for
/// this from anything claiming USB 2.0 support, and get upset without it.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct UsbDeviceQualifierDescriptor {
    /// Length of this structure, must be 10.
    pub length: u8,
    /// Type of this descriptor, must be `DeviceQualifier`.
    pub descriptor_type: UsbDescType,
    pub bcd_usb: U16<LittleEndian>,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    /// Must match the device descriptor.
    pub max_packet_size0: u8,
    /// Must match the device descriptor.
    pub num_configurations: u8,
    pub reserved: u8,
}

/// Description of a single available device configuration.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct UsbConfigurationDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    /// Type of this descriptor, must be `Config`.
    pub descriptor_type: UsbDescType,
    /// Total length of all descriptors in this configuration, concatenated.
    /// This will include this descriptor, plus every interface, class-specific
    /// and endpoint descriptor that follows it.
    pub total_length: U16<LittleEndian>,
    /// Number of interfaces in this configuration. Alternate settings of the
    /// same interface count once.
    pub num_interfaces: u8,
    /// Number to use when requesting this configuration via a
    /// `SetConfiguration` request.
    pub configuration_value: u8,
    /// Index of this configuration's name in the string descriptor table.
    pub configuration_s: u8,
    /// Bit set of device attributes:
    ///
    /// - Bit 7 should be set (indicates that device can be bus powered in USB
    /// 1.0).
    /// - Bit 6 indicates that the device can be self-powered.
    /// - Bit 5 indicates that the device can signal remote wakeup of the host
    /// (like a keyboard).
    /// - The rest are reserved and should be zero.
    pub attributes: u8,
    /// Maximum device power consumption in units of 2mA.
    pub max_power: u8,
}

/// Description of an interface within a configuration.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct UsbInterfaceDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    /// Type of this descriptor, must be `Interface`.
    pub descriptor_type: UsbDescType,
    /// ID of this interface.
    pub interface_number: u8,
    /// Allows a single `interface_number` to have several alternate interface
    /// settings, where each alternate increments this field. The audio
    /// streaming interface uses this to turn the isochronous endpoint on and
    /// off.
    pub alternate_setting: u8,
    /// Number of endpoint descriptors in this interface.
    pub num_endpoints: u8,
    /// Interface class code, distinguishing the type of interface.
    pub interface_class: u8,
    /// Interface subclass code, refining the class of interface.
    pub interface_subclass: u8,
    /// Protocol within the interface class/subclass.
    pub interface_protocol: u8,
    /// Index of interface name within string descriptor table.
    pub interface_s: u8,
}

/// Class-specific audio control interface header. Everything between this
/// and the next standard interface descriptor describes the audio topology.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct AcHeaderDescriptor {
    /// Length of this structure, 8 plus one per streaming interface.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    /// Must be `AC_HEADER`.
    pub descriptor_subtype: u8,
    /// Audio class release, BCD.
    pub bcd_adc: U16<LittleEndian>,
    /// Length of this header plus all unit and terminal descriptors after it.
    pub total_length: U16<LittleEndian>,
    /// Number of streaming interfaces in the collection.
    pub in_collection: u8,
    /// Interface numbers of those streaming interfaces.
    pub interface_nr: [u8; 1],
}

/// Where audio enters the function. For us, a (pretend) microphone.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct InputTerminalDescriptor {
    /// Must be 12.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    /// Unique among all terminals and units in the function.
    pub terminal_id: u8,
    pub terminal_type: U16<LittleEndian>,
    /// ID of an output terminal this one is paired with, or zero.
    pub assoc_terminal: u8,
    pub nr_channels: u8,
    /// Spatial location of the channels. Zero leaves it unspecified.
    pub channel_config: U16<LittleEndian>,
    pub channel_names: u8,
    pub terminal_s: u8,
}

/// A point in the signal path offering controls like mute and volume.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct FeatureUnitDescriptor {
    /// 7 plus `control_size` bytes for the master channel and each logical
    /// channel.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    pub unit_id: u8,
    /// ID of the unit or terminal feeding this one.
    pub source_id: u8,
    /// Size in bytes of each element of `controls`.
    pub control_size: u8,
    /// Control bitmaps, master channel first.
    pub controls: [u8; 1 + crate::CHANNELS],
    pub feature_s: u8,
}

/// Where audio leaves the function. For a microphone, that's the USB
/// streaming interface.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct OutputTerminalDescriptor {
    /// Must be 9.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    pub terminal_id: u8,
    pub terminal_type: U16<LittleEndian>,
    pub assoc_terminal: u8,
    pub source_id: u8,
    pub terminal_s: u8,
}

/// Links a streaming interface alternate setting to a terminal and names
/// its data format.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct AsGeneralDescriptor {
    /// Must be 7.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    /// ID of the terminal this interface is connected to.
    pub terminal_link: u8,
    /// Delay introduced by the data path, in frames.
    pub delay: u8,
    pub format_tag: U16<LittleEndian>,
}

/// Type I format (PCM and friends) with a single discrete sample rate.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct FormatTypeIDescriptor {
    /// 8 plus 3 per sample rate; 11 for us.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    pub format_type: u8,
    pub nr_channels: u8,
    /// Bytes per sample per channel.
    pub subframe_size: u8,
    /// Bits of each subframe actually used.
    pub bit_resolution: u8,
    /// Number of discrete sample rates that follow. Zero would mean a
    /// continuous range instead.
    pub sam_freq_type: u8,
    /// The rate, as 3 little-endian bytes.
    pub sam_freq: [u8; 3],
}

/// Audio class flavor of the endpoint descriptor. Same as the standard one
/// but with two extra bytes at the end, which makes it 9 bytes, not 7.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct AudioEndpointDescriptor {
    /// Must be 9.
    pub length: u8,
    /// Type of this descriptor, must be `Endpoint`.
    pub descriptor_type: UsbDescType,
    /// Address of this endpoint, where the bottom 4 bits give the endpoint
    /// number (0..15) and the top bit distinguishes IN (1) from OUT (0).
    pub endpoint_address: u8,
    /// Transfer type in the bottom 2 bits; for isochronous, sync type and
    /// usage in bits 2..6.
    pub attributes: u8,
    /// Maximum packet size this endpoint can accept/produce.
    pub max_packet_size: U16<LittleEndian>,
    /// Polling interval in frames. Isochronous at full speed wants 1.
    pub interval: u8,
    /// Only meaningful for synch endpoints, zero here.
    pub refresh: u8,
    /// Address of the synch endpoint, zero for none.
    pub synch_address: u8,
}

/// Class-specific isochronous audio data endpoint descriptor.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct AudioDataEndpointDescriptor {
    /// Must be 7.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    /// Sampling frequency / pitch control and packet padding bits.
    pub attributes: u8,
    pub lock_delay_units: u8,
    pub lock_delay: U16<LittleEndian>,
}

/// Byte length of a string descriptor holding `s`. Only ASCII is supported,
/// which keeps one byte of `s` equal to one UTF-16 code unit.
pub const fn string_descriptor_len(s: &str) -> usize {
    2 + 2 * s.len()
}

/// Builds a string descriptor for ASCII text `s` at compile time. `N` must be
/// `string_descriptor_len(s)`; see `usb_string!`, which takes care of that.
pub const fn string_descriptor<const N: usize>(s: &str) -> [u8; N] {
    let s = s.as_bytes();
    assert!(N == 2 + 2 * s.len());
    assert!(N <= u8::MAX as usize);
    let mut out = [0; N];
    out[0] = N as u8;
    out[1] = UsbDescType::String as u8;
    let mut i = 0;
    while i < s.len() {
        assert!(s[i].is_ascii());
        out[2 + 2 * i] = s[i];
        i += 1;
    }
    out
}

/// Expands to a `[u8; N]` string descriptor for an ASCII literal.
#[macro_export]
macro_rules! usb_string {
    ($s:expr) => {
        $crate::descriptor::string_descriptor::<
            { $crate::descriptor::string_descriptor_len($s) },
        >($s)
    };
}
