//! Board-wide constants. Values mirror the ones named in the phase-control
//! reference design; nothing here is tunable at runtime.

/// Number of TRIAC output channels this board supports.
pub const MAX_CHANNELS: usize = 4;

pub const MIN_FREQUENCY_HZ: u32 = 40;
pub const MAX_FREQUENCY_HZ: u32 = 70;

/// Mains period bounds, derived from the frequency bounds above.
pub const MIN_PERIOD_NS: u64 = 1_000_000_000 / MAX_FREQUENCY_HZ as u64;
pub const MAX_PERIOD_NS: u64 = 1_000_000_000 / MIN_FREQUENCY_HZ as u64;

/// Used when calibration is rejected, or hasn't run yet.
pub const DEFAULT_OPTO_HYSTERESIS_NS: u64 = 320_000;

/// A zero or negative `(mean_neg - mean_pos) / 4` is clamped up to this floor
/// so deadline arithmetic downstream never goes negative. See the Open
/// Question in the design notes on optocoupler symmetry.
pub const MIN_OPTO_HYSTERESIS_NS: u64 = 10_000;

pub const CALIB_TIME_MS: u32 = 5_000;

/// Std-dev threshold, per buffer, below which calibration is accepted.
pub const CALIB_STDDEV_ACCEPT_NS: u64 = 50_000;

/// Ring buffer length: enough half-cycle samples for `CALIB_TIME_MS` at the
/// fastest mains frequency we support.
pub const CALIB_BUFFER_LENGTH: usize =
    ((CALIB_TIME_MS as u64 * MAX_FREQUENCY_HZ as u64 + 999) / 1000) as usize;

/// Below this computed delay, the remaining half-cycle is too short for the
/// TRIAC to reliably reach latching current on a short gate pulse.
pub const HIGH_CONDUCTION_ANGLE_NS: u64 = 1_500;

pub const TRIAC_SHORT_PULSE_NS: u32 = 10_000;
pub const TRIAC_LONG_PULSE_NS: u32 = 500_000;

/// Angles within this many degrees of 0 or 180 snap to the boundary value,
/// to avoid degenerate near-edge gate pulses.
pub const PHASE_GUARD_DEG: u16 = 5;

/// Bound on how long a phase worker waits for a zero-crossing edge before
/// declaring the tracker has lost sync.
pub const THREAD_LATENCY_TIMEOUT_MS: u32 = 100;

/// Fader step period.
pub const FADER_STEP_MS: u32 = 50;

/// Coordinator state-machine tick period.
pub const COORDINATOR_TICK_MS: u32 = 100;
