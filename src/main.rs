#![no_main]
#![no_std]

use cfg_if::cfg_if;
use cortex_m::asm;
use cortex_m::peripheral::DWT;
use defmt::println;
use defmt_rtt as _;
use fugit::ExtU32;
use panic_probe as _;
use systick_monotonic::Systick;
use usb_device::prelude::*;
use usbd_serial::SerialPort;

mod board;
mod channel;
mod command;
mod config;
mod error;
mod fader;
mod phase;
mod statemachine;
mod telemetry;
mod tracker;
mod usb;

use board::TriacGate;
use channel::{ChannelSlot, FaderStatus, RequestedAngles};
use command::Action;
use config::{CALIB_TIME_MS, COORDINATOR_TICK_MS, FADER_STEP_MS, MAX_CHANNELS, THREAD_LATENCY_TIMEOUT_MS};
use fader::{FaderAccumulator, FaderPlan};
use phase::{pulse_kind_for_delay, HalfCycleAction, PulseKind};
use tracker::{half_cycle_for_edge, CalibBuffer, CalibrationOutcome, HalfCycle, TrackerMode, ZeroCrossRecord};

cfg_if! {
    if #[cfg(feature = "h7")] {
        use hal::{
            clocks::{Clocks, CrsSyncSrc, PllCfg, PllSrc},
            gpio::Edge,
            pac,
            usb_otg::Usb1BusType as UsbBusType,
        };
        // 520MHz core clock, per the `Clocks::full_speed()` PLL config below.
        const CORE_CLOCK_HZ: u64 = 520_000_000;
    } else if #[cfg(feature = "g4")] {
        use hal::{
            clocks::{Clk48Src, Clocks, CrsSyncSrc, InputSrc, PllSrc},
            gpio::Edge,
            pac,
            usb::UsbBusType,
        };
        const CORE_CLOCK_HZ: u64 = 168_000_000;
    }
}

/// Busy-wait window, in nanoseconds, tolerated past a computed deadline
/// before a gate pulse is skipped outright and counted as a missed cycle.
/// Guards against a preempted phase worker firing most of a half-cycle late.
const DEADLINE_SLACK_NS: u64 = 500_000;

#[rtic::app(device = pac, peripherals = true, dispatchers = [EXTI9_5, EXTI15_10, SPI1, SPI2])]
mod app {
    use super::*;

    #[monotonic(binds = SysTick, default = true)]
    type MyMono = Systick<1_000>;

    #[shared]
    struct Shared {
        zero_cross: ZeroCrossRecord,
        tracker_mode: TrackerMode,
        opto_hysteresis_ns: u64,
        calib_pos: CalibBuffer,
        calib_neg: CalibBuffer,
        zero_cross_input: board::ZeroCrossInput,
        channels: [ChannelSlot; MAX_CHANNELS],
        gates: [TriacGate; MAX_CHANNELS],
        usb_dev: UsbDevice<'static, UsbBusType>,
        usb_serial: SerialPort<'static, UsbBusType>,
    }

    #[local]
    struct Local {
        sync_watchdog_handle: Option<sync_watchdog::SpawnHandle>,
        fader_plan: [Option<FaderPlan>; MAX_CHANNELS],
        fader_accum: [FaderAccumulator; MAX_CHANNELS],
        fader_steps_taken: [u32; MAX_CHANNELS],
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local, init::Monotonics) {
        let mut cp = cx.core;
        let dp = pac::Peripherals::take().unwrap();

        cp.SCB.enable_icache();

        cp.DCB.enable_trace();
        cp.DWT.enable_cycle_counter();

        cfg_if! {
            if #[cfg(feature = "h7")] {
                let clock_cfg = Clocks {
                    pll_src: PllSrc::Hse(16_000_000),
                    pll1: PllCfg {
                        divm: 8,
                        ..Default::default()
                    },
                    hsi48_on: true,
                    usb_src: hal::clocks::UsbSrc::Hsi48,
                    ..Clocks::full_speed()
                };
            } else if #[cfg(feature = "g4")] {
                let clock_cfg = Clocks {
                    input_src: InputSrc::Pll(PllSrc::Hse(16_000_000)),
                    hsi48_on: true,
                    clk48_src: Clk48Src::Hsi48,
                    ..Default::default()
                };
            }
        }

        clock_cfg.setup().unwrap();

        #[cfg(feature = "h7")]
        hal::clocks::enable_crs(CrsSyncSrc::OtgHs);
        #[cfg(feature = "g4")]
        hal::clocks::enable_crs(CrsSyncSrc::Usb);

        println!("phasectl init: board = {}", board_name());

        let (zero_cross_input, gates) = board::setup_pins();

        let mono = Systick::new(cp.SYST, CORE_CLOCK_HZ as u32);

        cfg_if! {
            if #[cfg(feature = "h7")] {
                let usb_peripheral = usb::UsbPeripheral {
                    otg_global: dp.OTG1_HS_GLOBAL,
                    otg_device: dp.OTG1_HS_DEVICE,
                    otg_pwrclk: dp.OTG1_HS_PWRCLK,
                };
            } else if #[cfg(feature = "g4")] {
                let usb_peripheral = usb::UsbPeripheral { usb: dp.USB };
            }
        }
        let (usb_serial, usb_dev) = usb::setup(usb_peripheral, &clock_cfg);

        let channels = core::array::from_fn(|i| ChannelSlot::new(i as u8));

        calibration_timeout::spawn_after(CALIB_TIME_MS.millis()).ok();
        coordinator_tick::spawn_after(COORDINATOR_TICK_MS.millis()).ok();

        (
            Shared {
                zero_cross: ZeroCrossRecord::default(),
                tracker_mode: TrackerMode::Calibrating,
                opto_hysteresis_ns: tracker::default_hysteresis_ns(),
                calib_pos: CalibBuffer::new(),
                calib_neg: CalibBuffer::new(),
                zero_cross_input,
                channels,
                gates,
                usb_dev,
                usb_serial,
            },
            Local {
                sync_watchdog_handle: None,
                fader_plan: core::array::from_fn(|_| None),
                fader_accum: core::array::from_fn(|_| FaderAccumulator::default()),
                fader_steps_taken: core::array::from_fn(|_| 0),
            },
            init::Monotonics(mono),
        )
    }

    #[idle]
    fn idle(_cx: idle::Context) -> ! {
        loop {
            asm::nop();
        }
    }

    /// Mains zero-crossing feedback edge. During calibration this fires on
    /// both edges to sample both half-cycle durations; once live, only on
    /// the rising edge, per `board::ZeroCrossInput::set_trigger_edge`.
    #[task(
        binds = EXTI4,
        shared = [zero_cross, tracker_mode, calib_pos, calib_neg, zero_cross_input, channels],
        local = [sync_watchdog_handle],
        priority = 8
    )]
    fn zero_cross_isr(mut cx: zero_cross_isr::Context) {
        let now = now_ns();

        let pin_high = cx.shared.zero_cross_input.lock(|pin| {
            pin.clear_interrupt_pending();
            pin.is_high()
        });

        let mode = cx.shared.tracker_mode.lock(|m| *m);

        match mode {
            TrackerMode::Invalid => {}
            TrackerMode::Calibrating => {
                let half_cycle = half_cycle_for_edge(pin_high);
                let previous = cx.shared.zero_cross.lock(|zc| {
                    let previous = zc.current_ts_ns;
                    zc.previous_ts_ns = previous;
                    zc.current_ts_ns = now;
                    previous
                });
                if previous != 0 {
                    let delta = now.saturating_sub(previous);
                    match half_cycle {
                        HalfCycle::Positive => {
                            cx.shared.calib_pos.lock(|b| b.record(delta));
                        }
                        HalfCycle::Negative => {
                            cx.shared.calib_neg.lock(|b| b.record(delta));
                        }
                    }
                }
            }
            TrackerMode::Live | TrackerMode::Degraded => {
                let period_ns = cx.shared.zero_cross.lock(|zc| {
                    zc.observe(now);
                    zc.period_ns_or_zero()
                });

                if let Some(handle) = cx.local.sync_watchdog_handle.take() {
                    let _ = handle.cancel();
                }
                if let Ok(handle) = sync_watchdog::spawn_after(THREAD_LATENCY_TIMEOUT_MS.millis()) {
                    *cx.local.sync_watchdog_handle = Some(handle);
                }

                if period_ns == 0 {
                    return;
                }

                cx.shared.channels.lock(|channels| {
                    for ch in channels.iter() {
                        if ch.worker_active && !ch.disabled {
                            let _ = phase_worker::spawn(ch.index);
                        }
                    }
                });
            }
        }
    }

    /// Ends the startup calibration window and decides whether to trust the
    /// measured opto hysteresis or fall back to the default, degraded value.
    #[task(shared = [tracker_mode, opto_hysteresis_ns, calib_pos, calib_neg, zero_cross_input], priority = 2)]
    fn calibration_timeout(cx: calibration_timeout::Context) {
        let outcome = (cx.shared.calib_pos, cx.shared.calib_neg)
            .lock(|pos, neg| tracker::evaluate_calibration(pos, neg));

        (
            cx.shared.tracker_mode,
            cx.shared.opto_hysteresis_ns,
            cx.shared.zero_cross_input,
        )
            .lock(|mode, hysteresis_ns, pin| {
                match outcome {
                    CalibrationOutcome::Accepted { opto_hysteresis_ns } => {
                        *hysteresis_ns = opto_hysteresis_ns;
                        *mode = TrackerMode::Live;
                        println!("calibration accepted, hysteresis = {}ns", opto_hysteresis_ns);
                    }
                    CalibrationOutcome::Rejected => {
                        *hysteresis_ns = tracker::default_hysteresis_ns();
                        *mode = TrackerMode::Degraded;
                        println!("calibration rejected, running degraded");
                    }
                }
                pin.set_trigger_edge(Edge::Rising);
            });
    }

    /// Re-armed on every live edge by `zero_cross_isr`. Fires only if a full
    /// `THREAD_LATENCY_TIMEOUT_MS` window passes with no zero-crossing --
    /// the tracker has lost sync with the mains.
    #[task(priority = 1)]
    fn sync_watchdog(_cx: sync_watchdog::Context) {
        defmt::warn!("zero-crossing tracker lost sync");
    }

    /// Spawned once per active channel on every live rising edge. Computes
    /// both half-cycle deadlines from the last zero-crossing and busy-waits
    /// to each in turn, pulsing the gate -- one invocation covers both the
    /// negative half-cycle (already under way) and the positive half-cycle
    /// that starts at this edge.
    #[task(shared = [zero_cross, opto_hysteresis_ns, channels, gates], capacity = 4, priority = 7)]
    fn phase_worker(cx: phase_worker::Context, channel: u8) {
        let (reference_ns, period_ns) = cx
            .shared
            .zero_cross
            .lock(|zc| (zc.current_ts_ns, zc.period_ns_or_zero()));
        if period_ns == 0 {
            return;
        }
        let hysteresis_ns = cx.shared.opto_hysteresis_ns.lock(|h| *h);
        let irq_ref_ns = reference_ns + hysteresis_ns;

        let (pos_action, neg_action, still_active) = cx.shared.channels.lock(|channels| {
            let ch = &channels[channel as usize];
            (ch.computed_pos_ns, ch.computed_neg_ns, ch.worker_active)
        });

        if !still_active {
            return;
        }

        let mut gates = cx.shared.gates;
        let mut missed = false;

        if let Some(neg_ns) = neg_action {
            missed |= !pulse_at(&mut gates, channel, irq_ref_ns + neg_ns);
        }

        let pos_ref_ns = irq_ref_ns + period_ns / 2;
        if let Some(pos_ns) = pos_action {
            missed |= !pulse_at(&mut gates, channel, pos_ref_ns + pos_ns);
        }

        if missed {
            cx.shared.channels.lock(|channels| {
                channels[channel as usize].missed_cycles =
                    channels[channel as usize].missed_cycles.saturating_add(1);
            });
        }
    }

    /// Periodic per-channel state machine tick: re-derives each channel's
    /// status from its requested angles, recomputes phase delays when
    /// needed, and drives the gate directly for the OFF/ON states.
    #[task(shared = [channels, gates, zero_cross], priority = 3)]
    fn coordinator_tick(mut cx: coordinator_tick::Context) {
        let period_ns = cx.shared.zero_cross.lock(|zc| zc.period_ns_or_zero());

        cx.shared.channels.lock(|channels| {
            for ch in channels.iter_mut() {
                if ch.disabled {
                    continue;
                }
                let requested = ch.requested.guard_snapped();
                let outcome = statemachine::evaluate(ch.status, requested, ch.refresh);

                for command in outcome.commands.iter() {
                    match command {
                        statemachine::Command::StartWorker => ch.worker_active = true,
                        statemachine::Command::StopWorker => ch.worker_active = false,
                        statemachine::Command::WriteGateHigh => {
                            cx.shared.gates.lock(|gates| gates[ch.index as usize].set_high());
                        }
                        statemachine::Command::WriteGateLow => {
                            cx.shared.gates.lock(|gates| gates[ch.index as usize].set_low());
                        }
                        statemachine::Command::RecomputeNs => {
                            ch.computed_pos_ns =
                                to_option_ns(phase::half_cycle_action(requested.pos_deg, period_ns));
                            ch.computed_neg_ns =
                                to_option_ns(phase::half_cycle_action(requested.neg_deg, period_ns));
                        }
                    }
                }

                ch.status = outcome.next_status;
                if outcome.clear_refresh {
                    ch.refresh = false;
                }
            }
        });

        coordinator_tick::spawn_after(COORDINATOR_TICK_MS.millis()).ok();
    }

    /// Self-respawning fader step. Carries its channel and the generation it
    /// was (re)started under; a stale generation at any step boundary means
    /// it was cancelled, and the task exits without rescheduling itself.
    #[task(
        shared = [channels],
        local = [fader_plan, fader_accum, fader_steps_taken],
        capacity = 4,
        priority = 3
    )]
    fn fader_step(mut cx: fader_step::Context, channel: u8, generation: u32) {
        let idx = channel as usize;

        let should_continue = cx.shared.channels.lock(|channels| {
            let ch = &mut channels[idx];
            if ch.fader.generation != generation {
                return false;
            }

            if ch.fader.status == FaderStatus::Armed {
                cx.local.fader_accum[idx] = FaderAccumulator::start_from(ch.requested);
                cx.local.fader_plan[idx] = fader::plan(ch.requested, ch.fader.target, ch.fader.total_ms);
                cx.local.fader_steps_taken[idx] = 0;
                ch.fader.status = FaderStatus::Running;
            }

            let Some(plan) = cx.local.fader_plan[idx] else {
                ch.fader.status = FaderStatus::Stopped;
                return false;
            };

            let (angles, done) = cx.local.fader_accum[idx].step(plan, cx.local.fader_steps_taken[idx]);
            cx.local.fader_steps_taken[idx] += 1;

            if done {
                ch.requested = ch.fader.target;
                ch.fader.status = FaderStatus::Stopped;
                cx.local.fader_plan[idx] = None;
            } else {
                ch.requested = angles;
            }
            ch.refresh = true;
            !done
        });

        if should_continue {
            let _ = fader_step::spawn_after(FADER_STEP_MS.millis(), channel, generation);
        }
    }

    /// Command/telemetry link. A single leading byte `b'f'` is a frequency
    /// query, `b'c'` a calibration-sample-count query, `b'm'` a per-channel
    /// missed-cycle query (channel index in the second byte); anything else
    /// is read as a 5-byte `PhaseCommand` frame.
    #[task(
        binds = USB_LP,
        shared = [usb_dev, usb_serial, channels, zero_cross, calib_pos, calib_neg],
        priority = 4
    )]
    fn usb_isr(cx: usb_isr::Context) {
        (
            cx.shared.usb_dev,
            cx.shared.usb_serial,
            cx.shared.channels,
            cx.shared.zero_cross,
            cx.shared.calib_pos,
            cx.shared.calib_neg,
        )
            .lock(|usb_dev, usb_serial, channels, zero_cross, calib_pos, calib_neg| {
                if !usb_dev.poll(&mut [usb_serial]) {
                    return;
                }

                let mut buf = [0u8; 8];
                let count = match usb_serial.read(&mut buf) {
                    Ok(count) => count,
                    Err(_) => return,
                };
                if count == 0 {
                    return;
                }

                if buf[0] == b'f' {
                    let line = telemetry::format_frequency(zero_cross.period_ns_or_zero());
                    let _ = usb_serial.write(line.as_bytes());
                    return;
                }

                if buf[0] == b'c' {
                    let line = telemetry::format_calib_samples(calib_pos.len(), calib_neg.len());
                    let _ = usb_serial.write(line.as_bytes());
                    return;
                }

                if buf[0] == b'm' {
                    if count < 2 || buf[1] as usize >= MAX_CHANNELS {
                        return;
                    }
                    let line = telemetry::format_missed_cycles(channels[buf[1] as usize].missed_cycles);
                    let _ = usb_serial.write(line.as_bytes());
                    return;
                }

                if count < 5 {
                    return;
                }
                let Ok(raw) = command::PhaseCommand::unpack(&[buf[0], buf[1], buf[2], buf[3], buf[4]]) else {
                    return;
                };

                match command::validate(raw) {
                    Ok(Action::SetAngles(v)) => {
                        let ch = &mut channels[v.channel_index as usize];
                        ch.fader.generation += 1;
                        ch.fader.status = FaderStatus::Stopped;
                        ch.requested = RequestedAngles::new(v.pos_deg, v.neg_deg);
                        ch.refresh = true;
                    }
                    Ok(Action::StartFade(v)) => {
                        let ch = &mut channels[v.channel_index as usize];
                        ch.fader.generation += 1;
                        ch.fader.target = RequestedAngles::new(v.pos_deg, v.neg_deg);
                        ch.fader.total_ms = v.time_ms as u32;
                        ch.fader.status = FaderStatus::Armed;
                        defmt::info!(
                            "fader: started ch={} target=({}, {}) over {}ms",
                            v.channel_index,
                            v.pos_deg,
                            v.neg_deg,
                            v.time_ms
                        );
                        let _ = fader_step::spawn(v.channel_index, ch.fader.generation);
                    }
                    Ok(Action::StopFade { channel_index }) => {
                        let ch = &mut channels[channel_index as usize];
                        ch.fader.generation += 1;
                        ch.fader.status = FaderStatus::Stopped;
                        defmt::info!("fader: stopped ch={}", channel_index);
                    }
                    Err(e) => {
                        defmt::warn!("command rejected: {}", e);
                    }
                }
            });
    }
}

fn to_option_ns(action: HalfCycleAction) -> Option<u64> {
    match action {
        HalfCycleAction::Skip => None,
        HalfCycleAction::FireAfter(ns) => Some(ns),
    }
}

fn board_name() -> &'static str {
    cfg_if! {
        if #[cfg(feature = "h7")] {
            "h7"
        } else if #[cfg(feature = "g4")] {
            "g4"
        }
    }
}

/// Nanosecond clock reading, from the DWT cycle counter -- the RTIC
/// monotonic (`Systick`, 1kHz) schedules tasks at ms granularity, which
/// isn't fine enough for phase deadlines. The DWT counter is a free-running
/// 32-bit register that wraps roughly every 8 seconds at `CORE_CLOCK_HZ`;
/// the tracker's `saturating_sub` period math tolerates a wrap landing
/// inside a single zero-crossing interval as one dropped reading.
fn now_ns() -> u64 {
    DWT::cycle_count() as u64 * 1_000_000_000 / CORE_CLOCK_HZ
}

/// Busy-waits until `deadline_ns` (measured against the same epoch as
/// `now_ns`), then pulses the gate. Mirrors the reference design's "sleep
/// until absolute deadline, then fire" worker loop, realized as a bounded
/// spin since RTIC software tasks have no blocking sleep primitive.
///
/// Returns `false` without touching the gate if `deadline_ns` is already
/// more than `DEADLINE_SLACK_NS` in the past -- the caller counts this as a
/// missed cycle.
fn pulse_at(
    gates: &mut impl rtic::Mutex<T = [TriacGate; MAX_CHANNELS]>,
    channel: u8,
    deadline_ns: u64,
) -> bool {
    let now = now_ns();
    if now > deadline_ns + DEADLINE_SLACK_NS {
        return false;
    }
    while now_ns() < deadline_ns {
        asm::nop();
    }

    let delay_ns = deadline_ns.saturating_sub(now);
    let pulse_ns = match pulse_kind_for_delay(delay_ns) {
        PulseKind::Short => config::TRIAC_SHORT_PULSE_NS,
        PulseKind::Long => config::TRIAC_LONG_PULSE_NS,
    };

    gates.lock(|gates| gates[channel as usize].set_high());
    let cycles = (pulse_ns as u64 * CORE_CLOCK_HZ / 1_000_000_000).max(1) as u32;
    asm::delay(cycles);
    gates.lock(|gates| gates[channel as usize].set_low());
    true
}
