//! Zero-crossing tracker: calibration-phase statistics and the live
//! zero-crossing record. Buffer/statistics logic is pure and host-testable;
//! `main.rs` wires the IRQ-context glue (reading the pin, reading the
//! monotonic clock, publishing under the RTIC lock) around it.

use crate::config::{
    CALIB_BUFFER_LENGTH, CALIB_STDDEV_ACCEPT_NS, DEFAULT_OPTO_HYSTERESIS_NS, MAX_PERIOD_NS,
    MIN_OPTO_HYSTERESIS_NS, MIN_PERIOD_NS,
};
use heapless::Vec;

/// Which half-cycle a calibration sample belongs to.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format, Debug)]
pub enum HalfCycle {
    Positive,
    Negative,
}

/// Assigns the interval that just ended to a half-cycle, based on the pin
/// state observed *after* the edge.
///
/// This resolves the edge-assignment ambiguity the reference design leaves
/// open between its two variants: if the pin reads high after the edge,
/// the positive half-cycle has just begun, so the interval that ended was
/// the negative one (and vice versa).
pub fn half_cycle_for_edge(pin_high_after_edge: bool) -> HalfCycle {
    if pin_high_after_edge {
        HalfCycle::Negative
    } else {
        HalfCycle::Positive
    }
}

/// Bounded sample buffer for one half-cycle's calibration durations. Once
/// full, further samples are dropped rather than overwriting -- calibration
/// only needs one full window's worth of data, and a fixed buffer keeps the
/// IRQ handler allocation-free.
#[derive(Default)]
pub struct CalibBuffer {
    samples: Vec<u64, CALIB_BUFFER_LENGTH>,
}

impl CalibBuffer {
    pub const fn new() -> Self {
        Self { samples: Vec::new() }
    }

    /// Returns `true` if the sample was recorded, `false` if the buffer was
    /// already full.
    pub fn record(&mut self, delta_ns: u64) -> bool {
        self.samples.push(delta_ns).is_ok()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == CALIB_BUFFER_LENGTH
    }

    /// Integer mean and population standard deviation, in nanoseconds.
    /// Returns `(0, u64::MAX)` for an empty buffer so it always fails the
    /// acceptance check rather than dividing by zero.
    pub fn mean_stddev(&self) -> (u64, u64) {
        let n = self.samples.len() as u64;
        if n == 0 {
            return (0, u64::MAX);
        }
        let sum: u64 = self.samples.iter().sum();
        let mean = sum / n;

        let variance_sum: u64 = self
            .samples
            .iter()
            .map(|&s| {
                let d = s.abs_diff(mean);
                d * d
            })
            .sum();
        let variance = variance_sum / n;
        (mean, integer_sqrt(variance))
    }
}

fn integer_sqrt(value: u64) -> u64 {
    if value == 0 {
        return 0;
    }
    let mut x = value;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + value / x) / 2;
    }
    x
}

/// Result of evaluating both calibration buffers at the end of the
/// calibration window.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format, Debug)]
pub enum CalibrationOutcome {
    Accepted { opto_hysteresis_ns: u64 },
    Rejected,
}

pub fn evaluate_calibration(pos: &CalibBuffer, neg: &CalibBuffer) -> CalibrationOutcome {
    let (mean_pos, stddev_pos) = pos.mean_stddev();
    let (mean_neg, stddev_neg) = neg.mean_stddev();

    if stddev_pos >= CALIB_STDDEV_ACCEPT_NS || stddev_neg >= CALIB_STDDEV_ACCEPT_NS {
        return CalibrationOutcome::Rejected;
    }

    let raw = if mean_neg >= mean_pos {
        (mean_neg - mean_pos) / 4
    } else {
        0
    };
    let opto_hysteresis_ns = raw.max(MIN_OPTO_HYSTERESIS_NS);
    CalibrationOutcome::Accepted { opto_hysteresis_ns }
}

/// Tracker lifecycle, per the data model's lifecycle section.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format, Debug)]
pub enum TrackerMode {
    Invalid,
    Calibrating,
    Live,
    /// Calibration was rejected; running with the default hysteresis.
    Degraded,
}

/// The single published zero-crossing record. All three fields are written
/// together under the RTIC priority-ceiling lock so a reader never
/// observes a torn combination -- the no-lock-visible-from-IRQ-handler
/// alternative the design notes call a seqlock or atomic pointer swap,
/// realized here as RTIC's resource lock instead, since that's the
/// primitive the rest of this firmware already uses for shared state.
#[derive(Clone, Copy, Default, defmt::Format, Debug)]
pub struct ZeroCrossRecord {
    pub previous_ts_ns: u64,
    pub current_ts_ns: u64,
    pub period_ns: u64,
}

impl ZeroCrossRecord {
    /// Folds in a newly observed rising edge.
    pub fn observe(&mut self, now_ns: u64) {
        self.previous_ts_ns = self.current_ts_ns;
        self.current_ts_ns = now_ns;
        self.period_ns = self.current_ts_ns.saturating_sub(self.previous_ts_ns);
    }

    pub fn is_valid(&self) -> bool {
        self.period_ns > MIN_PERIOD_NS && self.period_ns < MAX_PERIOD_NS
    }

    /// `period_ns()` read, per the external interface: 0 if out of bounds.
    pub fn period_ns_or_zero(&self) -> u64 {
        if self.is_valid() {
            self.period_ns
        } else {
            0
        }
    }
}

pub fn default_hysteresis_ns() -> u64 {
    DEFAULT_OPTO_HYSTERESIS_NS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_assignment_rule() {
        assert_eq!(half_cycle_for_edge(true), HalfCycle::Negative);
        assert_eq!(half_cycle_for_edge(false), HalfCycle::Positive);
    }

    #[test]
    fn mean_and_stddev_of_constant_samples() {
        let mut buf = CalibBuffer::new();
        for _ in 0..10 {
            buf.record(10_000_000);
        }
        let (mean, stddev) = buf.mean_stddev();
        assert_eq!(mean, 10_000_000);
        assert_eq!(stddev, 0);
    }

    #[test]
    fn buffer_stops_recording_when_full() {
        let mut buf = CalibBuffer::new();
        for _ in 0..CALIB_BUFFER_LENGTH {
            assert!(buf.record(1));
        }
        assert!(buf.is_full());
        assert!(!buf.record(1));
    }

    #[test]
    fn calibration_accepted_on_tight_distributions() {
        let mut pos = CalibBuffer::new();
        let mut neg = CalibBuffer::new();
        for _ in 0..50 {
            pos.record(10_000_000);
            neg.record(10_001_280); // +4 * 320us hysteresis
        }
        match evaluate_calibration(&pos, &neg) {
            CalibrationOutcome::Accepted { opto_hysteresis_ns } => {
                assert_eq!(opto_hysteresis_ns, 320_000);
            }
            CalibrationOutcome::Rejected => panic!("expected acceptance"),
        }
    }

    #[test]
    fn calibration_rejected_on_noisy_distribution() {
        let mut pos = CalibBuffer::new();
        let mut neg = CalibBuffer::new();
        // Alternate +/- 100us around the mean: stddev is ~100us, over the
        // 50us acceptance threshold.
        for i in 0..50 {
            let jitter = if i % 2 == 0 { 100_000 } else { 0 };
            pos.record(10_000_000 + jitter);
            neg.record(10_000_000 + jitter);
        }
        assert_eq!(evaluate_calibration(&pos, &neg), CalibrationOutcome::Rejected);
    }

    #[test]
    fn calibration_floors_negative_or_zero_hysteresis() {
        let mut pos = CalibBuffer::new();
        let mut neg = CalibBuffer::new();
        for _ in 0..20 {
            pos.record(10_000_000);
            neg.record(10_000_000); // symmetric optocoupler: zero raw hysteresis
        }
        match evaluate_calibration(&pos, &neg) {
            CalibrationOutcome::Accepted { opto_hysteresis_ns } => {
                assert_eq!(opto_hysteresis_ns, MIN_OPTO_HYSTERESIS_NS);
            }
            CalibrationOutcome::Rejected => panic!("expected acceptance"),
        }
    }

    #[test]
    fn zero_cross_record_validity_bounds() {
        let mut rec = ZeroCrossRecord::default();
        rec.observe(0);
        rec.observe(20_000_000); // 50Hz
        assert!(rec.is_valid());
        assert_eq!(rec.period_ns_or_zero(), 20_000_000);

        let mut rec2 = ZeroCrossRecord::default();
        rec2.observe(0);
        rec2.observe(1_000_000); // way too fast, line noise
        assert!(!rec2.is_valid());
        assert_eq!(rec2.period_ns_or_zero(), 0);
    }
}
