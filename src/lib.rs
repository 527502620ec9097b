// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB Audio Class 1.0 microphone, application layer.
//!
//! This is the part of the RP2040 audio firmware that doesn't care what chip
//! it's running on:
//!
//! - `descriptor` and `device` define, as typed `#[repr(C)]` records, every
//!   byte the device tells the host about itself. Lengths that USB wants
//!   repeated in headers (`wTotalLength` and friends) are computed from the
//!   records' sizes at compile time, so they can't drift from the content.
//! - `resolve` maps a GET_DESCRIPTOR request onto those bytes.
//! - `control` handles the one control request we care about (choosing the
//!   streaming interface's alternate setting) and owns the resulting state.
//! - `stream` owns two precomputed audio frames and hands one to the
//!   isochronous endpoint every time the host has collected the other.
//!
//! Everything that touches hardware lives in the firmware binary, which
//! talks to this crate through the `Endpoints` trait. That split means the
//! whole thing can be exercised by `cargo test` on a host machine.
//!
//! The signal is a placeholder: a half-cycle of sine per millisecond on both
//! channels, alternating polarity each frame, which comes out as a 500 Hz
//! tone. It's there so you can hear that streaming works, nothing more.

#![cfg_attr(not(test), no_std)]

pub mod control;
pub mod descriptor;
pub mod device;
pub mod resolve;
pub mod stream;

pub use control::{ControlHandler, InterfaceState, RequestError, UsbSetupPacket};
pub use descriptor::{UsbDescType, UsbDir, UsbTransferType};
pub use resolve::resolve;
pub use stream::{Frame, StreamingEngine};

/// Number of channels in the stream. Samples are interleaved L, R, L, R.
pub const CHANNELS: usize = 2;
/// The one sample rate we support, in Hz.
pub const SAMPLE_RATE: u32 = 48_000;
/// Bytes per sample per channel.
pub const SUBFRAME_SIZE: usize = 2;
/// Bits of each subframe that actually carry signal.
pub const BIT_RESOLUTION: u8 = 16;

/// Individual samples (counting each channel separately) in one 1 ms frame.
pub const SAMPLES_PER_FRAME: usize = SAMPLE_RATE as usize * CHANNELS / 1000;
/// Bytes of audio data in one 1 ms frame.
pub const FRAME_BYTES: usize = SAMPLES_PER_FRAME * SUBFRAME_SIZE;

/// Largest packet the control endpoint moves.
pub const EP0_MAX_PACKET_SIZE: u8 = 64;
/// Address of the isochronous IN endpoint carrying audio to the host.
pub const AUDIO_IN_ADDR: u8 = UsbDir::In.endpoint(2);
/// Capacity of the isochronous IN endpoint.
pub const AUDIO_IN_MAX_PACKET_SIZE: u16 = 256;

/// Interface number of the audio control interface.
pub const AUDIO_CONTROL_INTERFACE: u8 = 0;
/// Interface number of the audio streaming interface.
pub const AUDIO_STREAMING_INTERFACE: u8 = 1;
/// Total interfaces in our one configuration.
pub const NUM_INTERFACES: usize = 2;

/// Streaming interface alternate setting with no endpoints, i.e. "off."
pub const STREAMING_ALT_IDLE: u8 = 0;
/// Streaming interface alternate setting carrying the isochronous endpoint.
pub const STREAMING_ALT_ACTIVE: u8 = 1;

// A frame has to fit in one isochronous packet, or the host will be getting
// partial frames.
const _: () = assert!(FRAME_BYTES <= AUDIO_IN_MAX_PACKET_SIZE as usize);

/// Collaborator interface to whatever moves bytes across the bus.
///
/// The firmware implements this on top of the RP2040 USB controller; tests
/// implement it by recording calls. Both methods must be cheap and must not
/// block, since they get called from the completion path.
///
/// There's no completion callback registration here. Instead, whoever owns
/// the transport calls `StreamingEngine::on_complete` when the host has
/// collected a buffer from the audio endpoint.
pub trait Endpoints {
    /// Prepares endpoint `address` for transfers of type `kind`.
    fn ep_init(&mut self, address: u8, kind: UsbTransferType, max_packet_size: u16);

    /// Queues `data` to be sent on the next IN transaction for `address`.
    /// An empty `data` sends a zero-length packet.
    fn ep_write(&mut self, address: u8, data: &[u8]);
}
