// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Double-buffered isochronous audio source.
//!
//! The host collects one packet from the audio endpoint every millisecond.
//! Every time it has collected one, the transport tells us (`on_complete`),
//! and we have to hand over the next packet before the next frame starts.
//!
//! Both packets are computed up front: the first half of a sine cycle, and
//! its negation. Alternating between them produces a continuous sine with a
//! 2 ms period. Since neither buffer is ever rewritten, handing over the next
//! one is just picking it, and there's no way for the transport to catch us
//! mid-update. A real audio source would need a producer filling the idle
//! slot and an over/underrun policy; we don't have one.
//!
//! Whether anything is sent at all is decided by the streaming interface's
//! alternate setting. Alternate 0 means the host reserved no bandwidth for
//! us, so once it's selected, completions stop producing writes.

use byteorder::LittleEndian;
use log::debug;
use num_traits::Float;
use zerocopy::{AsBytes, I16};

use crate::control::InterfaceState;
use crate::{
    Endpoints, UsbTransferType, AUDIO_IN_ADDR, AUDIO_IN_MAX_PACKET_SIZE,
    AUDIO_STREAMING_INTERFACE, CHANNELS, SAMPLES_PER_FRAME, STREAMING_ALT_ACTIVE,
};

/// One millisecond of interleaved little-endian samples.
pub type Frame = [I16<LittleEndian>; SAMPLES_PER_FRAME];

/// Peak value of the generated sine, about a quarter of full scale.
pub const AMPLITUDE: f32 = 8196.0;

/// Computes the two frames: the rising half of a sine cycle across one frame,
/// and its phase inverse. Each sample is copied onto every channel.
pub fn sine_frames() -> (Frame, Frame) {
    let mut positive = [I16::new(0); SAMPLES_PER_FRAME];
    let mut negative = [I16::new(0); SAMPLES_PER_FRAME];

    let steps = SAMPLES_PER_FRAME / CHANNELS;
    let step = core::f32::consts::PI / steps as f32;
    for i in 0..steps {
        // Truncates toward zero, so |d| never exceeds AMPLITUDE and negating
        // it can't overflow.
        let d = (Float::sin(i as f32 * step) * AMPLITUDE) as i16;
        for ch in 0..CHANNELS {
            positive[i * CHANNELS + ch] = I16::new(d);
            negative[i * CHANNELS + ch] = I16::new(-d);
        }
    }
    (positive, negative)
}

/// Feeds the isochronous IN endpoint from two precomputed frames.
pub struct StreamingEngine {
    positive: Frame,
    negative: Frame,
    /// Which frame goes out next: `true` for `positive`. Flipped before
    /// every submission.
    toggled: bool,
    /// Whether the host has selected the streaming alternate setting and we
    /// keep the endpoint fed.
    armed: bool,
    /// Whether the transport holds a frame the host hasn't collected yet.
    /// Survives disarming: switching to the idle alternate setting stops the
    /// host polling, it doesn't take the frame back.
    in_flight: bool,
}

impl StreamingEngine {
    /// Builds the engine, computing both frames. This does floating point
    /// trig for every sample, so do it once at startup, not per frame.
    pub fn new() -> Self {
        let (positive, negative) = sine_frames();
        Self {
            positive,
            negative,
            toggled: false,
            armed: false,
            in_flight: false,
        }
    }

    /// Sets up the audio endpoint on the transport.
    pub fn init(&self, endpoints: &mut impl Endpoints) {
        endpoints.ep_init(
            AUDIO_IN_ADDR,
            UsbTransferType::Isochronous,
            AUDIO_IN_MAX_PACKET_SIZE,
        );
    }

    pub fn positive(&self) -> &Frame {
        &self.positive
    }

    pub fn negative(&self) -> &Frame {
        &self.negative
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Brings the engine in line with the streaming interface's alternate
    /// setting. Call after every control request that might have changed it.
    ///
    /// When streaming has just been switched on, this submits the first frame,
    /// since no completion will arrive until something has been sent. If a
    /// frame from an earlier run is still waiting on the endpoint, that one
    /// primes the stream instead, and nothing new is written.
    pub fn sync(&mut self, interfaces: &InterfaceState, endpoints: &mut impl Endpoints) {
        match (self.armed, streaming(interfaces)) {
            (false, true) => {
                debug!("audio stream armed");
                self.armed = true;
                if !self.in_flight {
                    self.submit_next(endpoints);
                }
            }
            (true, false) => self.disarm(),
            _ => (),
        }
    }

    /// Handles the host having collected the frame in flight. Submits the
    /// other frame and returns `true`, unless streaming has been switched off,
    /// in which case this disarms and sends nothing.
    pub fn on_complete(
        &mut self,
        interfaces: &InterfaceState,
        endpoints: &mut impl Endpoints,
    ) -> bool {
        self.in_flight = false;
        if !streaming(interfaces) {
            self.disarm();
            return false;
        }
        self.armed = true;
        self.submit_next(endpoints);
        true
    }

    /// Stops submitting frames. Used on reconfiguration, and when the host
    /// selects the idle alternate setting. A frame already handed to the
    /// transport stays there.
    pub fn disarm(&mut self) {
        if self.armed {
            debug!("audio stream disarmed");
        }
        self.armed = false;
    }

    /// Disarms and forgets any frame in flight. Only call this once the
    /// transport has actually dropped its pending buffer, as after a bus
    /// reset.
    pub fn reset(&mut self) {
        self.disarm();
        self.in_flight = false;
    }

    fn submit_next(&mut self, endpoints: &mut impl Endpoints) {
        self.toggled = !self.toggled;
        let frame = if self.toggled {
            &self.positive
        } else {
            &self.negative
        };
        endpoints.ep_write(AUDIO_IN_ADDR, frame[..].as_bytes());
        self.in_flight = true;
    }
}

impl Default for StreamingEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn streaming(interfaces: &InterfaceState) -> bool {
    interfaces.alternate_setting(AUDIO_STREAMING_INTERFACE) == Some(STREAMING_ALT_ACTIVE)
}
