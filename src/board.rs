//! Clock & GPIO adapter. Wraps `stm32_hal2` pins the way the teacher's
//! `setup::setup_pins()` wraps peripherals for `main.rs`'s RTIC `#[init]`
//! (that module is named throughout the teacher's `main.rs` but its source
//! was never retrieved into this pack -- see `DESIGN.md`): a thin, typed
//! layer so the rest of the firmware never names a `Port`/pin number
//! directly.
//!
//! `now_ns()` lives in `main.rs` as a free function reading the DWT cycle
//! counter directly, not the RTIC monotonic -- the monotonic (`Systick`,
//! bound in `main.rs`) only schedules tasks at 1kHz, too coarse for phase
//! deadlines. `register_edge_irq` has no dynamic counterpart: RTIC binds an
//! EXTI line to a hardware task statically at compile time, which is
//! strictly more restrictive (and more checkable) than the abstract spec's
//! runtime registration API. See `DESIGN.md`.

use cfg_if::cfg_if;
use hal::gpio::{self, Edge, Pin, PinMode, Port};

use crate::config::MAX_CHANNELS;

/// The mains zero-crossing feedback input, from the board's optocoupler.
pub struct ZeroCrossInput {
    pin: Pin,
}

impl ZeroCrossInput {
    pub fn new(mut pin: Pin, edge: Edge) -> Self {
        pin.enable_interrupt(edge);
        Self { pin }
    }

    /// Level of the line immediately after an edge, used by the
    /// calibration handler to decide which half-cycle just ended.
    pub fn is_high(&self) -> bool {
        self.pin.is_high()
    }

    pub fn clear_interrupt_pending(&mut self) {
        self.pin.clear_interrupt_pending();
    }

    /// Switches the triggering edge -- both edges during calibration (to
    /// capture both half-cycle durations), rising-only once live (halves
    /// IRQ load; the rising edge alone is enough once hysteresis is known).
    pub fn set_trigger_edge(&mut self, edge: Edge) {
        self.pin.enable_interrupt(edge);
    }
}

/// One TRIAC gate output.
pub struct TriacGate {
    pin: Pin,
}

impl TriacGate {
    pub fn new(mut pin: Pin) -> Self {
        pin.set_low();
        Self { pin }
    }

    pub fn set_high(&mut self) {
        self.pin.set_high();
    }

    pub fn set_low(&mut self) {
        self.pin.set_low();
    }
}

/// Per-board GPIO assignment: which port/pin each channel's gate lives on,
/// and where the opto feedback line is. Feature-gated per MCU the same way
/// the reference firmware gates `h7` vs `g4` peripheral and pin choices.
pub struct BoardConfig {
    pub opto_port: Port,
    pub opto_pin: u8,
    pub gate_ports: [Port; MAX_CHANNELS],
    pub gate_pins: [u8; MAX_CHANNELS],
    pub labels: [&'static str; MAX_CHANNELS],
}

cfg_if! {
    if #[cfg(feature = "h7")] {
        pub const BOARD: BoardConfig = BoardConfig {
            opto_port: Port::B,
            opto_pin: 12,
            gate_ports: [Port::C, Port::C, Port::C, Port::C],
            gate_pins: [6, 7, 8, 9],
            labels: ["ch1", "ch2", "ch3", "ch4"],
        };
    } else if #[cfg(feature = "g4")] {
        pub const BOARD: BoardConfig = BoardConfig {
            opto_port: Port::C,
            opto_pin: 4,
            gate_ports: [Port::B, Port::B, Port::B, Port::B],
            gate_pins: [0, 1, 2, 3],
            labels: ["ch1", "ch2", "ch3", "ch4"],
        };
    }
}

/// Builds the zero-cross input and the four gate outputs from `BOARD`.
/// Called once from `#[init]`.
pub fn setup_pins() -> (ZeroCrossInput, [TriacGate; MAX_CHANNELS]) {
    let opto_pin = Pin::new(BOARD.opto_port, BOARD.opto_pin, PinMode::Input);
    let zero_cross = ZeroCrossInput::new(opto_pin, Edge::Both);

    let gates = core::array::from_fn(|i| {
        let pin = Pin::new(BOARD.gate_ports[i], BOARD.gate_pins[i], PinMode::Output);
        TriacGate::new(pin)
    });

    (zero_cross, gates)
}
