// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptor lookup for GET_DESCRIPTOR.

use log::trace;
use num_traits::FromPrimitive;
use zerocopy::AsBytes;

use crate::descriptor::UsbDescType;
use crate::device::*;

/// Finds the descriptor named by a GET_DESCRIPTOR request's `value` field,
/// which carries the descriptor type in the top 8 bits and an index in the
/// bottom 8.
///
/// Returns `None` for anything we don't have. The caller must not respond to
/// the request in that case (stall it, don't send zero bytes).
///
/// The returned slice is the full descriptor; truncating it to the host's
/// `length` is the caller's job.
pub fn resolve(value: u16) -> Option<&'static [u8]> {
    let index = (value & 0xFF) as u8;
    let bytes: &'static [u8] = match UsbDescType::from_u16(value >> 8)? {
        UsbDescType::Device => DEVICE_DESCRIPTOR.as_bytes(),
        UsbDescType::Config => CONFIGURATION.as_bytes(),
        UsbDescType::DeviceQualifier => self_sized(DEVICE_QUALIFIER.as_bytes()),
        UsbDescType::String => self_sized(match index {
            STRING_LANGUAGE => &LANG_DESCRIPTOR[..],
            STRING_MANUFACTURER => &MANUFACTURER_DESCRIPTOR[..],
            STRING_PRODUCT => &PRODUCT_DESCRIPTOR[..],
            STRING_SERIAL => &SERIAL_DESCRIPTOR[..],
            _ => {
                trace!("no string descriptor {}", index);
                return None;
            }
        }),
        other => {
            trace!("not serving {:?} descriptors", other);
            return None;
        }
    };
    trace!("descriptor {:#06x}: {} bytes", value, bytes.len());
    Some(bytes)
}

/// Trims `bytes` to the length given by its own first byte.
fn self_sized(bytes: &'static [u8]) -> &'static [u8] {
    &bytes[..usize::from(bytes[0])]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(ty: UsbDescType, index: u8) -> u16 {
        (ty as u16) << 8 | u16::from(index)
    }

    #[test]
    fn strings_are_self_describing() {
        for i in 0..=3 {
            let s = resolve(req(UsbDescType::String, i)).unwrap();
            assert_eq!(usize::from(s[0]), s.len());
            assert_eq!(s[1], UsbDescType::String as u8);
            assert_eq!(s.len() % 2, 0);
        }
    }

    #[test]
    fn language_is_us_english() {
        assert_eq!(resolve(req(UsbDescType::String, 0)), Some(&[4, 3, 0x09, 0x04][..]));
    }

    #[test]
    fn product_string_decodes() {
        let s = resolve(req(UsbDescType::String, STRING_PRODUCT)).unwrap();
        let units: Vec<u16> = s[2..]
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(String::from_utf16(&units).unwrap(), "Pico USB Audio");
    }

    #[test]
    fn unknown_string_index_is_not_found() {
        for i in 4..=255 {
            assert_eq!(resolve(req(UsbDescType::String, i)), None);
        }
    }

    #[test]
    fn device_and_configuration_are_full_size() {
        let d = resolve(req(UsbDescType::Device, 0)).unwrap();
        assert_eq!(d.len(), 18);
        assert_eq!(d, DEVICE_DESCRIPTOR.as_bytes());
        let c = resolve(req(UsbDescType::Config, 0)).unwrap();
        assert_eq!(c.len(), usize::from(u16::from_le_bytes([c[2], c[3]])));
    }

    #[test]
    fn qualifier_uses_its_length_byte() {
        let q = resolve(req(UsbDescType::DeviceQualifier, 0)).unwrap();
        assert_eq!(q.len(), 10);
        assert_eq!(q[1], 0x06);
    }

    #[test]
    fn other_types_are_not_found() {
        assert_eq!(resolve(req(UsbDescType::Interface, 0)), None);
        assert_eq!(resolve(req(UsbDescType::Endpoint, 0)), None);
        assert_eq!(resolve(0x0F00), None);
        assert_eq!(resolve(0x0000), None);
    }
}
