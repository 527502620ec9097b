// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RP2040 USB Audio microphone firmware.
//!
//! This is the hardware half of the device: it brings the chip up, runs the
//! USB controller directly through its registers, and routes whatever the
//! host does to the `rp2040_uac` library, which knows what an audio device is
//! supposed to say.
//!
//! Like the library, this is written to be read top to bottom. There's no HAL
//! and no USB stack; `main` sets up clocks and the controller in a straight
//! line, then polls the controller's status flags in a loop:
//!
//! - SETUP packets go to a small EP0 dispatcher. It answers the handful of
//!   standard requests enumeration needs, looks descriptors up through
//!   `rp2040_uac::resolve`, passes interface requests to the
//!   `ControlHandler`, and stalls anything else.
//! - Buffer completions on EP0 continue multi-packet replies and status
//!   stages. Completions on the audio endpoint go to the `StreamingEngine`,
//!   which hands back the next frame.
//! - A bus reset forgets everything, including any frame left waiting on
//!   the audio endpoint.
//!
//! The controller is reached by the library through `Rp2040Endpoints`, our
//! implementation of its `Endpoints` trait.
//!
//! # Logging
//!
//! The library logs through the `log` facade. No logger is installed here, so
//! those calls compile down to nothing. For watching what's going on, the
//! firmware toggles GPIOs instead; hang a logic analyzer off them.
//!
//! # A note on `unsafe`
//!
//! Most `unsafe` here is inside register `write`/`modify` closures, where
//! `rp2040_pac` asks for it on every multi-bit field whether or not it's
//! actually dangerous. Those don't get comments. The rest is about getting
//! references into USB SRAM, and is commented.

#![no_std]
#![no_main]

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use cortex_m_rt::entry;
use num_traits::FromPrimitive;

use rp2040_uac::control::{DataStage, UsbSetupRequest, RECIPIENT_INTERFACE};
use rp2040_uac::device::NUM_CONFIGURATIONS;
use rp2040_uac::{
    resolve, ControlHandler, Endpoints, StreamingEngine, UsbDir, UsbSetupPacket,
    UsbTransferType, AUDIO_IN_ADDR,
};

use panic_halt as _;

// GPIO numbers of pins used here, other than USB. The firmware toggles these
// pins to indicate activity, so that you can watch them on a logic analyzer to
// understand the event flow.
cfg_if::cfg_if! {
    if #[cfg(feature = "target-pico")] {
        const LED_PIN: u8 = 25; // any activity
        const SETUP_PIN: u8 = 0; // SETUP request being handled
        const BUFF_PIN: u8 = 1; // activity on a buffer
        const RESET_PIN: u8 = 2; // bus reset!
        const EP_PIN: [u8;3] = [3, 4, 5]; // activity on EP0, 1, 2
        const STALL_PIN: u8 = 6; // we refused a control request
    } else if #[cfg(feature = "target-feather")] {
        const LED_PIN: u8 = 13; // any activity
        const SETUP_PIN: u8 = 0; // SETUP request being handled
        const BUFF_PIN: u8 = 1; // activity on a buffer
        const RESET_PIN: u8 = 2; // bus reset!
        const EP_PIN: [u8;3] = [3, 4, 5]; // activity on EP0, 1, 2
        const STALL_PIN: u8 = 6; // we refused a control request
    } else {
        compile_error!("missing or unknown target-* feature");
    }
}

/// Offset of the EP0 data buffer within USB SRAM, fixed by the hardware.
const EP0_BUFFER_OFFSET: usize = 0x100;
/// First offset available for other endpoints' buffers. Must be 64-byte
/// aligned.
const AUDIO_BUFFER_OFFSET: usize = 0x180;

#[entry]
fn main() -> ! {
    // Out of the boot ROM and into our code. The CPU is running from the ring
    // oscillator (ROSC), a few MHz and not very accurate, and every pin is
    // still an input.

    // Taking the peripherals writes nothing to hardware. It just marks them as
    // taken so nobody can take them twice.
    let p = rp2040_pac::Peripherals::take().unwrap();

    //////////////////////////////////////////////////////////////////////////
    // Diagnostic GPIOs. These are the only tracing the firmware does, so set
    // them up first; if bring-up hangs, a `raise_pin` moved around this
    // function will tell you where.
    //
    // SIO itself has no reset to release. IO_BANK0, which routes pins to it,
    // does.

    p.RESETS.reset.modify(|_, w| w.io_bank0().clear_bit());
    while !p.RESETS.reset_done.read().io_bank0().bit() {}

    // Route each pin to SIO, then enable all their output drivers at once.
    let mut diag_mask = 0;
    for pin in [LED_PIN, SETUP_PIN, BUFF_PIN, RESET_PIN, STALL_PIN]
        .into_iter()
        .chain(EP_PIN)
    {
        p.IO_BANK0.gpio[pin as usize].gpio_ctrl.write(|w| w.funcsel().sio());
        diag_mask |= 1 << pin;
    }
    p.SIO.gpio_oe_set.write(|w| unsafe { w.bits(diag_mask) });

    //////////////////////////////////////////////////////////////////////////
    // Clocks. USB needs a 48 MHz clock accurate to a fraction of a percent,
    // which ROSC can't give us, so everything moves onto the 12 MHz crystal
    // and the two PLLs multiply it up from there.
    //
    // XOSC and CLOCKS come out of reset already released; the PLLs don't.

    // Start the crystal oscillator. The magic is the "1-15 MHz" frequency
    // range in the low bits and the enable key in the high bits.
    p.XOSC.ctrl.write(|w| unsafe { w.bits(0xfab_aa0) });
    // It takes a while to settle; the status bit tells us when it has.
    while !p.XOSC.status.read().stable().bit() {}
    // clk_ref picks its source through a glitchless mux, and clk_sys is fed
    // from clk_ref out of reset, so this one write moves the whole chip onto
    // the crystal.
    p.CLOCKS.clk_ref_ctrl.write(|w| w.src().xosc_clksrc());
    // The mux reports the source it has actually switched to as a one-hot
    // value. Bit 2 is XOSC.
    while p.CLOCKS.clk_ref_selected.read().bits() != (1 << 2) {}
    // Nothing uses ROSC anymore. The value is the "disable" key.
    p.ROSC.ctrl.write(|w| unsafe { w.bits(0xd1e_fa4) });

    // Now PLL_SYS, for a faster CPU. USB would work at 12 MHz, but every
    // completion has to be answered within a frame, and more speed makes that
    // easy.
    //
    // The PLL multiplies the reference up into a VCO running between 750 and
    // 1600 MHz, then divides it back down through two post dividers:
    //
    //   12 MHz / REFDIV 1 * FBDIV 132 = 1584 MHz VCO
    //   1584 MHz / (POSTDIV1 6 * POSTDIV2 2) = 132 MHz
    p.RESETS.reset.modify(|_, w| w.pll_sys().clear_bit());
    while !p.RESETS.reset_done.read().pll_sys().bit() {}
    p.PLL_SYS.cs.write(|w| unsafe { w.refdiv().bits(1) });
    p.PLL_SYS.fbdiv_int.write(|w| unsafe { w.fbdiv_int().bits(132) });
    // Power up the PLL core and VCO, leaving the post dividers off until the
    // loop has locked.
    p.PLL_SYS.pwr.write(|w| w.pd().clear_bit().vcopd().clear_bit());
    while !p.PLL_SYS.cs.read().lock().bit() {}
    p.PLL_SYS.prim.write(|w| unsafe { w.postdiv1().bits(6).postdiv2().bits(2) });
    p.PLL_SYS.pwr.modify(|_, w| w.postdivpd().clear_bit());

    // clk_sys can't take PLL_SYS directly. It goes through the aux mux, so
    // select the PLL there first, then point the main (glitchless) mux at the
    // aux input. Bit 1 of the one-hot readback is the aux input.
    p.CLOCKS.clk_sys_ctrl.write(|w| w.auxsrc().clksrc_pll_sys());
    p.CLOCKS.clk_sys_ctrl.modify(|_, w| w.src().clksrc_clk_sys_aux());
    while p.CLOCKS.clk_sys_selected.read().bits() != (1 << 1) {}
    // 132 MHz from here on.

    // clk_peri follows clk_sys. USB doesn't use it; the UART would, if you
    // want to add one for debugging.
    p.CLOCKS.clk_peri_ctrl.write(|w| w.auxsrc().clk_sys().enable().set_bit());

    // PLL_USB, for the 48 MHz USB clock, driven from the same 12 MHz
    // reference and started the same way:
    //
    //   12 MHz / REFDIV 1 * FBDIV 100 = 1200 MHz VCO
    //   1200 MHz / (POSTDIV1 5 * POSTDIV2 5) = 48 MHz
    p.RESETS.reset.modify(|_, w| w.pll_usb().clear_bit());
    while !p.RESETS.reset_done.read().pll_usb().bit() {}
    p.PLL_USB.cs.write(|w| unsafe { w.refdiv().bits(1) });
    p.PLL_USB.fbdiv_int.write(|w| unsafe { w.fbdiv_int().bits(100) });
    p.PLL_USB.pwr.write(|w| w.pd().clear_bit().vcopd().clear_bit());
    while !p.PLL_USB.cs.read().lock().bit() {}
    p.PLL_USB.prim.write(|w| unsafe { w.postdiv1().bits(5).postdiv2().bits(5) });
    p.PLL_USB.pwr.modify(|_, w| w.postdivpd().clear_bit());

    // clk_usb only has an aux mux, so selecting the source and enabling the
    // clock is a single write.
    p.CLOCKS.clk_usb_ctrl.write(|w| w.auxsrc().clksrc_pll_usb().enable().set_bit());

    //////////////////////////////////////////////////////////////////////////
    // USB controller, device mode, on the onboard PHY.

    // Cycle the controller through reset so it starts from a known state even
    // if a debugger restarted us without resetting the chip.
    p.RESETS.reset.modify(|_, w| w.usbctrl().set_bit());
    p.RESETS.reset.modify(|_, w| w.usbctrl().clear_bit());
    while !p.RESETS.reset_done.read().usbctrl().bit() {}

    // The control registers at the bottom of USB SRAM aren't cleared by the
    // reset. Leftover `enable` or AVAILABLE bits from a previous run would
    // have the controller doing things we never asked for, so zero them.
    p.USBCTRL_DPRAM.setup_packet_low.write(|w| unsafe { w.bits(0) });
    p.USBCTRL_DPRAM.setup_packet_high.write(|w| unsafe { w.bits(0) });
    for epc in &p.USBCTRL_DPRAM.ep_control {
        epc.write(|w| unsafe { w.bits(0) });
    }
    for epb in &p.USBCTRL_DPRAM.ep_buffer_control {
        epb.write(|w| unsafe { w.bits(0) });
    }

    // Connect the controller to the on-chip PHY rather than the GPIO-based
    // alternatives. `softcon` is undocumented, but the vendor SDK sets it here
    // too.
    p.USBCTRL_REGS.usb_muxing.write(|w| w.to_phy().set_bit().softcon().set_bit());
    // The controller won't pull up DP without seeing VBUS, and not every board
    // routes VBUS to the chip. Tell it VBUS is always present.
    p.USBCTRL_REGS.usb_pwr.write(|w| w.vbus_detect().set_bit()
        .vbus_detect_override_en().set_bit()
    );
    p.USBCTRL_REGS.main_ctrl.write(|w| w
        .controller_en().set_bit()
        .host_ndevice().clear_bit()
    );
    // EP0 has no endpoint control register to ask for per-buffer status, so
    // that's requested here instead. Every buffer that moves through EP0 will
    // set its bit in `buff_status`.
    p.USBCTRL_REGS.sie_ctrl.write(|w| w.ep0_int_1buf().set_bit());
    // Conditions we want reported in `ints`. Nothing is wired to the NVIC;
    // the loop below polls.
    p.USBCTRL_REGS.inte.write(|w| w
        // Some endpoint finished with a buffer.
        .buff_status().set_bit()
        // The host reset the bus.
        .bus_reset().set_bit()
        // A SETUP packet arrived on EP0.
        .setup_req().set_bit()
    );

    //////////////////////////////////////////////////////////////////////////
    // USB SRAM buffers.

    let buffers = {
        let base = rp2040_pac::USBCTRL_DPRAM::ptr() as usize;
        // Safety:
        //
        // 1. These are fixed, in-bounds, non-overlapping regions of USB SRAM,
        //    which nothing else in the program refers to. (The PAC's view of
        //    DPRAM stops at the buffer control registers, below 0x100.)
        //
        // 2. We're in `main`, before the loop, and `cortex_m_rt` won't let
        //    anything call `main` again, so these references are made once.
        //
        // 3. Any bit pattern is a valid `u8`, so whatever garbage was in SRAM
        //    at reset is fine to look at. We zero it anyway.
        //
        // 4. The hardware is only ever allowed to touch a buffer while its
        //    AVAILABLE bit is set, and we only write a buffer while that bit
        //    is clear. For the audio endpoint that's the streaming engine's
        //    job: it won't write again until the host has collected the
        //    previous frame, and the bus reset path below takes the buffer
        //    back from the hardware before letting the engine forget it.
        //    `usb_start_tx` checks. The `UnsafeCell` is what makes writing
        //    through a shared reference legal.
        let ep0 = unsafe { &*((base + EP0_BUFFER_OFFSET) as *const UnsafeCell<[u8; 64]>) };
        let audio = unsafe { &*((base + AUDIO_BUFFER_OFFSET) as *const UnsafeCell<[u8; 256]>) };
        unsafe {
            (*ep0.get()) = [0; 64];
            (*audio.get()) = [0; 256];
        }
        Buffers { ep0, audio }
    };

    //////////////////////////////////////////////////////////////////////////
    // Application state, in Plain Old Local Variables.

    // Owns the interface alternate settings; the engine borrows them.
    let control = ControlHandler::new();
    // Computes both audio frames here, once.
    let mut engine = StreamingEngine::new();
    // The library's view of the controller.
    let mut endpoints = Rp2040Endpoints {
        dpram: &p.USBCTRL_DPRAM,
        buffers: &buffers,
    };
    // SET_ADDRESS has to be acknowledged from the old address, so the new
    // one waits here until the status stage is done.
    let mut new_address = None;
    // Remaining packets of a control IN reply.
    let mut data_stage = DataStage::default();
    // Value of the last SET_CONFIGURATION; 0 means unconfigured.
    let mut configuration = 0u8;

    engine.init(&mut endpoints);

    // Pull-up on DP. The host notices us now.
    p.USBCTRL_REGS.sie_ctrl.modify(|_, w| w.pullup_en().set_bit());

    loop {
        let ints = p.USBCTRL_REGS.ints.read();

        if ints.setup_req().bit() {
            raise_pin(&p.SIO, LED_PIN);
            raise_pin(&p.SIO, SETUP_PIN);

            p.USBCTRL_REGS.sie_status.write(|w| w.setup_rec().set_bit());

            let mut setup_packet = [0; 8];
            setup_packet[..4].copy_from_slice(&p.USBCTRL_DPRAM.setup_packet_low.read().bits().to_le_bytes());
            setup_packet[4..].copy_from_slice(&p.USBCTRL_DPRAM.setup_packet_high.read().bits().to_le_bytes());
            let setup = zerocopy::LayoutVerified::<_, UsbSetupPacket>::new(&setup_packet[..]).unwrap().into_ref();

            // A new SETUP abandons whatever reply was in progress, and the
            // first packet after SETUP is DATA1 in either direction.
            data_stage = DataStage::default();
            EP0_IN_CFG.next_pid_1.store(true, Ordering::Relaxed);
            EP0_OUT_CFG.next_pid_1.store(true, Ordering::Relaxed);

            let reqty = UsbDir::from_u8(setup.request_type);
            let req = UsbSetupRequest::from_u8(setup.request);
            let refused = match (reqty, req) {
                (Some(UsbDir::Out), Some(UsbSetupRequest::SetAddress)) => {
                    new_address = Some(setup.value.get() as u8);
                    endpoints.ep_write(EP0_IN_ADDR, &[]);
                    false
                }
                (Some(UsbDir::Out), Some(UsbSetupRequest::SetConfiguration)) => {
                    match u8::try_from(setup.value.get()) {
                        Ok(c) if c <= NUM_CONFIGURATIONS => {
                            // One configuration, so there's nothing to
                            // switch to, but the host expects every interface
                            // back at alternate 0.
                            configuration = c;
                            control.reset();
                            engine.disarm();
                            endpoints.ep_write(EP0_IN_ADDR, &[]);
                            false
                        }
                        _ => true,
                    }
                }
                (Some(UsbDir::Out), _) => {
                    // Any other standard request to the device. Acknowledge
                    // it so the host doesn't wait on us forever.
                    endpoints.ep_write(EP0_IN_ADDR, &[]);
                    false
                }
                (Some(UsbDir::In), Some(UsbSetupRequest::GetDescriptor)) => {
                    match resolve(setup.value.get()) {
                        Some(bytes) => {
                            start_reply(&mut data_stage, &mut endpoints, bytes, setup.length.get());
                            false
                        }
                        None => true,
                    }
                }
                (Some(UsbDir::In), Some(UsbSetupRequest::GetStatus)) => {
                    // Bus powered, no remote wakeup.
                    start_reply(&mut data_stage, &mut endpoints, &[0, 0], setup.length.get());
                    false
                }
                (Some(UsbDir::In), Some(UsbSetupRequest::GetConfiguration)) => {
                    let c = usize::from(configuration);
                    start_reply(&mut data_stage, &mut endpoints, &CONFIGURATION_VALUES[c..=c], setup.length.get());
                    false
                }
                _ if setup.request_type & 0x80 == 0 => {
                    // OUT, but not a plain standard device request: that's
                    // the handler's business.
                    let r = control.handle_out(setup, &mut endpoints);
                    engine.sync(control.interfaces(), &mut endpoints);
                    r.is_err()
                }
                _ if setup.request_type & 0x1F == RECIPIENT_INTERFACE => {
                    // GET_INTERFACE, interface GET_STATUS, and class
                    // requests like GET_CUR, which the handler refuses.
                    match control.handle_in(setup) {
                        Ok(bytes) => {
                            start_reply(&mut data_stage, &mut endpoints, bytes, setup.length.get());
                            false
                        }
                        Err(_) => true,
                    }
                }
                // Everything else is refused, notably GET_STATUS on an
                // endpoint (we never halt ours) and any other standard device
                // IN request.
                _ => true,
            };
            if refused {
                raise_pin(&p.SIO, STALL_PIN);
                usb_stall_ep0(&p.USBCTRL_REGS, &p.USBCTRL_DPRAM);
                lower_pin(&p.SIO, STALL_PIN);
            }

            lower_pin(&p.SIO, SETUP_PIN);
        }

        if ints.buff_status().bit() {
            raise_pin(&p.SIO, LED_PIN);
            raise_pin(&p.SIO, BUFF_PIN);

            let orig_bufbits = p.USBCTRL_REGS.buff_status.read().bits();
            let mut bufbits = orig_bufbits;

            while bufbits != 0 {
                let lowbit_index = bufbits.trailing_zeros();
                bufbits ^= 1 << lowbit_index;

                // Buffer status bits come in IN/OUT pairs per endpoint.
                let epnum = (lowbit_index >> 1) as u8;
                let dir = if lowbit_index & 1 == 0 { UsbDir::In } else { UsbDir::Out };
                let ep_addr = dir.endpoint(epnum);

                if let Some(&pin) = EP_PIN.get(epnum as usize) {
                    raise_pin(&p.SIO, pin);
                }

                if let Some(ep) = endpoint_config(ep_addr) {
                    // The hardware hands a buffer back by clearing AVAILABLE.
                    let bc = p.USBCTRL_DPRAM.ep_buffer_control[ep.buffer_control_index()].read();
                    assert!(!bc.available_0().bit());
                }

                match ep_addr {
                    EP0_IN_ADDR => {
                        if let Some(a) = new_address.take() {
                            p.USBCTRL_REGS.addr_endp.write(|w| unsafe { w.address().bits(a) });
                        } else if let Some(packet) = data_stage.next_packet() {
                            endpoints.ep_write(EP0_IN_ADDR, packet);
                        } else {
                            // Reply finished; take the host's zero-length
                            // status packet.
                            usb_start_rx(&p.USBCTRL_DPRAM, &EP0_OUT_CFG, 0);
                        }
                    }
                    AUDIO_IN_ADDR => {
                        engine.on_complete(control.interfaces(), &mut endpoints);
                    }
                    _ => {
                        // EP0 OUT status stages land here. Nothing to do.
                    }
                }

                if let Some(&pin) = EP_PIN.get(epnum as usize) {
                    lower_pin(&p.SIO, pin);
                }
            }
            p.USBCTRL_REGS.buff_status.write(|w| unsafe { w.bits(orig_bufbits) });

            lower_pin(&p.SIO, BUFF_PIN);
        }

        if ints.bus_reset().bit() {
            raise_pin(&p.SIO, LED_PIN);
            raise_pin(&p.SIO, RESET_PIN);
            p.USBCTRL_REGS.sie_status.write(|w| w.bus_reset().set_bit());

            new_address = None;
            data_stage = DataStage::default();
            configuration = 0;
            control.reset();
            // The host won't come back for a frame left on the audio
            // endpoint, so take the buffer back from the hardware. Only then
            // is it safe for the engine to write a new one.
            p.USBCTRL_DPRAM.ep_buffer_control[AUDIO_IN_CFG.buffer_control_index()]
                .write(|w| unsafe { w.bits(0) });
            engine.reset();
            p.USBCTRL_REGS.addr_endp.write(|w| unsafe { w.address().bits(0) });

            lower_pin(&p.SIO, RESET_PIN);
        }

        lower_pin(&p.SIO, LED_PIN);
    }
}

////////////////////////////////////////////////////////////////////////////
// The library's window onto the controller.

struct Rp2040Endpoints<'a> {
    dpram: &'a rp2040_pac::USBCTRL_DPRAM,
    buffers: &'a Buffers,
}

impl Endpoints for Rp2040Endpoints<'_> {
    fn ep_init(&mut self, address: u8, kind: UsbTransferType, max_packet_size: u16) {
        let ep = endpoint_config(address).expect("ep_init on unknown endpoint");
        let buf = self.buffers.get(ep.data_buffer_index);
        assert!(usize::from(max_packet_size) <= core::mem::size_of_val(buf));

        // EP0 is always on and has no endpoint control register.
        if let Some(epci) = ep.endpoint_control_index() {
            let dpram_offset = buf as *const _ as *const u8 as u32
                - rp2040_pac::USBCTRL_DPRAM::ptr() as u32;
            let dpram_offset = u16::try_from(dpram_offset).unwrap();

            self.dpram.ep_control[epci].write(|w| unsafe {
                w.enable().set_bit()
                    .interrupt_per_buff().set_bit()
                    .endpoint_type().bits(kind as u8)
                    .buffer_address().bits(dpram_offset)
            });
        }
    }

    fn ep_write(&mut self, address: u8, data: &[u8]) {
        let ep = endpoint_config(address).expect("ep_write on unknown endpoint");
        usb_start_tx(self.dpram, self.buffers, ep, data);
    }
}

/// Configures a given endpoint to send data (device-to-host, IN) when the host
/// next asks for it.
///
/// The contents of `buffer` will be _copied_ into USB SRAM, so you can
/// reuse `buffer` immediately after this returns.
fn usb_start_tx(
    usb_dp_regs: &rp2040_pac::USBCTRL_DPRAM,
    ep_buffers: &Buffers,
    ep: &UsbEndpointConfiguration,
    buffer: &[u8],
) {
    assert!(UsbDir::of_endpoint_addr(ep.address) == UsbDir::In);

    let epbuffer = ep_buffers.get(ep.data_buffer_index);
    assert!(buffer.len() <= core::mem::size_of_val(epbuffer));
    // A new SETUP is allowed to abandon a reply on EP0, but anywhere else a
    // buffer still marked AVAILABLE belongs to the hardware.
    if ep.kind != UsbTransferType::Control {
        let bc = usb_dp_regs.ep_buffer_control[ep.buffer_control_index()].read();
        assert!(!bc.available_0().bit());
    }
    let epbuffer = epbuffer.get() as *mut u8;
    // Safety: the buffer pointer comes straight from `Buffers`, the length
    // was checked above, and the hardware isn't using this buffer: AVAILABLE
    // is clear (checked above, except on EP0, where SETUP resets the
    // transfer).
    unsafe {
        epbuffer.copy_from_nonoverlapping(buffer.as_ptr(), buffer.len());
    }

    let np = ep.next_pid_1.load(Ordering::Relaxed);
    usb_dp_regs.ep_buffer_control[ep.buffer_control_index()].write(|w| unsafe {
        w.pid_0().bit(np)
            .full_0().set_bit()
            .available_0().set_bit()
            .length_0().bits(buffer.len() as u16)
    });
    // Full-speed isochronous is always DATA0. Everything else alternates.
    if ep.kind != UsbTransferType::Isochronous {
        ep.next_pid_1.store(!np, Ordering::Relaxed);
    }
}

/// Begins the reply to a control IN request. The rest of `bytes`, if any,
/// goes out from the EP0 IN completion path.
fn start_reply(
    data_stage: &mut DataStage,
    endpoints: &mut impl Endpoints,
    bytes: &'static [u8],
    requested: u16,
) {
    *data_stage = DataStage::new(bytes, requested);
    // With nothing to send, the data stage is a single zero-length packet.
    let packet = data_stage.next_packet().unwrap_or(&[]);
    endpoints.ep_write(EP0_IN_ADDR, packet);
}

/// Readies an OUT endpoint to accept up to `len` bytes from the host.
fn usb_start_rx(
    usb_dp_regs: &rp2040_pac::USBCTRL_DPRAM,
    ep: &UsbEndpointConfiguration,
    len: usize,
) {
    assert!(len <= 64);
    assert!(UsbDir::of_endpoint_addr(ep.address) == UsbDir::Out);

    let np = ep.next_pid_1.load(Ordering::Relaxed);
    usb_dp_regs.ep_buffer_control[ep.buffer_control_index()].write(|w| unsafe {
        w.pid_0().bit(np)
            .full_0().clear_bit()
            .available_0().set_bit()
            .length_0().bits(len as u16)
    });
    ep.next_pid_1.store(!np, Ordering::Relaxed);
}

/// Refuses the current control request. The hardware only honors the STALL
/// bits while the matching `ep_stall_arm` bit is set, and clears that on the
/// next SETUP, so this doesn't outlive the request.
fn usb_stall_ep0(
    usb_regs: &rp2040_pac::USBCTRL_REGS,
    usb_dp_regs: &rp2040_pac::USBCTRL_DPRAM,
) {
    usb_regs.ep_stall_arm.write(|w| w.ep0_in().set_bit().ep0_out().set_bit());
    for ep in [&EP0_IN_CFG, &EP0_OUT_CFG] {
        usb_dp_regs.ep_buffer_control[ep.buffer_control_index()].write(|w| w.stall().set_bit());
    }
}

////////////////////////////////////////////////////////////////////////////
// Endpoint bookkeeping.

struct UsbEndpointConfiguration {
    address: u8,
    kind: UsbTransferType,

    /// Index of this endpoint's data buffer; see `Buffers::get`.
    data_buffer_index: usize,

    /// Keeps track of which DATA PID (DATA0/DATA1) is expected on this endpoint
    /// next. If `true`, we're expecting `DATA1`, otherwise `DATA0`.
    ///
    /// This is an `AtomicBool` so that we can update it in a `static`, not
    /// because we actually rely on its atomicity for any reason.
    next_pid_1: AtomicBool,
}

impl UsbEndpointConfiguration {
    /// Index into the `ep_control` array, which starts at EP1 IN and
    /// alternates IN, OUT.
    fn endpoint_control_index(&self) -> Option<usize> {
        match self.address & 0xF {
            0 => None,
            n => Some(usize::from(n - 1) * 2 + self.out_offset()),
        }
    }

    /// Index into the `ep_buffer_control` array, which starts at EP0 IN and
    /// alternates IN, OUT.
    fn buffer_control_index(&self) -> usize {
        usize::from(self.address & 0xF) * 2 + self.out_offset()
    }

    fn out_offset(&self) -> usize {
        match UsbDir::of_endpoint_addr(self.address) {
            UsbDir::In => 0,
            UsbDir::Out => 1,
        }
    }
}

/// Buffer references, once they're prepared and initialized.
struct Buffers {
    /// Fixed EP0 buffer, defined by the hardware, shared by both directions.
    ep0: &'static UnsafeCell<[u8; 64]>,
    /// Audio IN buffer, big enough for the largest isochronous packet we
    /// declare.
    audio: &'static UnsafeCell<[u8; 256]>,
}

impl Buffers {
    /// Gets the buffer named by a `data_buffer_index`.
    fn get(&self, i: usize) -> &UnsafeCell<[u8]> {
        match i {
            0 => self.ep0,
            _ => self.audio,
        }
    }
}

/// GET_CONFIGURATION replies, indexed by configuration value.
static CONFIGURATION_VALUES: [u8; NUM_CONFIGURATIONS as usize + 1] = [0, 1];

const EP0_IN_ADDR: u8 = UsbDir::In.endpoint(0);
const EP0_OUT_ADDR: u8 = UsbDir::Out.endpoint(0);

static EP0_OUT_CFG: UsbEndpointConfiguration = UsbEndpointConfiguration {
    address: EP0_OUT_ADDR,
    kind: UsbTransferType::Control,
    data_buffer_index: 0,
    next_pid_1: AtomicBool::new(false),
};
static EP0_IN_CFG: UsbEndpointConfiguration = UsbEndpointConfiguration {
    address: EP0_IN_ADDR,
    kind: UsbTransferType::Control,
    data_buffer_index: 0,
    next_pid_1: AtomicBool::new(false),
};
static AUDIO_IN_CFG: UsbEndpointConfiguration = UsbEndpointConfiguration {
    address: AUDIO_IN_ADDR,
    kind: UsbTransferType::Isochronous,
    data_buffer_index: 1,
    next_pid_1: AtomicBool::new(false),
};

fn endpoint_config(address: u8) -> Option<&'static UsbEndpointConfiguration> {
    [&EP0_OUT_CFG, &EP0_IN_CFG, &AUDIO_IN_CFG]
        .into_iter()
        .find(|ep| ep.address == address)
}

////////////////////////////////////////////////////////////////////////////
// Assorted RP2040 support stuff.

/// Raise the GPIO pin with index `pin`.
///
/// The pin must already be configured as an SIO output.
#[inline(always)]
fn raise_pin(sio: &rp2040_pac::SIO, pin: u8) {
    sio.gpio_out_set.write(|w| unsafe { w.bits(1 << pin) });
}

/// Lower the GPIO pin with index `pin`.
///
/// The pin must already be configured as an SIO output.
#[inline(always)]
fn lower_pin(sio: &rp2040_pac::SIO, pin: u8) {
    sio.gpio_out_clr.write(|w| unsafe { w.bits(1 << pin) });
}

// Second stage bootloader, matched to the board's flash chip.
cfg_if::cfg_if! {
    if #[cfg(feature = "target-feather")] {
        #[link_section = ".boot_loader"]
        #[used]
        static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_GD25Q64CS;
    } else if #[cfg(feature = "target-pico")] {
        #[link_section = ".boot_loader"]
        #[used]
        static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_W25Q080;
    }
}
