//! Fader step arithmetic. Re-architected against the reference design's
//! thread-cancelled-at-arbitrary-points fader: here the running state is a
//! plain accumulator re-entered once per step, with a single cancellation
//! check at the step boundary (the generation counter on
//! `FaderDescriptor`). `main.rs` drives this as a self-respawning RTIC
//! software task; the math below is pure and host-testable.

use crate::channel::RequestedAngles;
use crate::config::FADER_STEP_MS;

#[derive(Clone, Copy, PartialEq, Eq, defmt::Format, Debug)]
pub struct FaderPlan {
    pub steps: u32,
    /// Fixed-point (x256) per-step delta, signed.
    pub step_pos_q8: i32,
    pub step_neg_q8: i32,
}

/// Builds a fade plan from `total_ms` at the fixed `FADER_STEP_MS` cadence.
/// Returns `None` if `total_ms` doesn't even cover one step -- the caller
/// surfaces this as a validation error rather than silently rounding to a
/// single, too-fast step.
pub fn plan(current: RequestedAngles, target: RequestedAngles, total_ms: u32) -> Option<FaderPlan> {
    let steps = total_ms / FADER_STEP_MS;
    if steps == 0 {
        return None;
    }
    let delta_pos = target.pos_deg as i32 - current.pos_deg as i32;
    let delta_neg = target.neg_deg as i32 - current.neg_deg as i32;
    Some(FaderPlan {
        steps,
        step_pos_q8: (delta_pos * 256) / steps as i32,
        step_neg_q8: (delta_neg * 256) / steps as i32,
    })
}

/// One fader task's running accumulator, carried across self-respawns in
/// the task's `#[local]` state.
#[derive(Clone, Copy, Default, defmt::Format, Debug)]
pub struct FaderAccumulator {
    pub pos_q8: i32,
    pub neg_q8: i32,
}

impl FaderAccumulator {
    pub fn start_from(current: RequestedAngles) -> Self {
        Self {
            pos_q8: (current.pos_deg as i32) * 256,
            neg_q8: (current.neg_deg as i32) * 256,
        }
    }

    /// Advances one step and returns the rounded angles to commit this
    /// tick, plus whether this was the final step (in which case the
    /// caller should commit the exact target instead of the rounded
    /// accumulator, to guarantee the ramp lands exactly on target).
    pub fn step(&mut self, plan: FaderPlan, steps_taken: u32) -> (RequestedAngles, bool) {
        self.pos_q8 += plan.step_pos_q8;
        self.neg_q8 += plan.step_neg_q8;
        let done = steps_taken + 1 >= plan.steps;
        let angles = RequestedAngles::new(round_q8(self.pos_q8), round_q8(self.neg_q8));
        (angles, done)
    }
}

fn round_q8(value_q8: i32) -> u16 {
    ((value_q8 + 128) / 256).clamp(0, 180) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_fast_a_fade_is_rejected() {
        assert!(plan(
            RequestedAngles::new(0, 0),
            RequestedAngles::new(90, 90),
            FADER_STEP_MS - 1
        )
        .is_none());
    }

    #[test]
    fn ramp_lands_exactly_on_target() {
        let current = RequestedAngles::new(0, 0);
        let target = RequestedAngles::new(110, 110);
        let total_ms = 5_000;
        let p = plan(current, target, total_ms).unwrap();
        assert_eq!(p.steps, total_ms / FADER_STEP_MS);

        let mut acc = FaderAccumulator::start_from(current);
        let mut last = current;
        for step_idx in 0..p.steps {
            let (angles, done) = acc.step(p, step_idx);
            last = angles;
            if done {
                assert_eq!(step_idx + 1, p.steps);
            }
        }
        assert_eq!(last, target);
    }

    #[test]
    fn monotonic_ramp_never_overshoots_before_the_final_step() {
        let current = RequestedAngles::new(10, 10);
        let target = RequestedAngles::new(170, 170);
        let p = plan(current, target, 1_000).unwrap();
        let mut acc = FaderAccumulator::start_from(current);
        let mut prev = current.pos_deg;
        for step_idx in 0..p.steps {
            let (angles, _) = acc.step(p, step_idx);
            assert!(angles.pos_deg >= prev);
            assert!(angles.pos_deg <= target.pos_deg);
            prev = angles.pos_deg;
        }
    }

    #[test]
    fn asymmetric_target_ramps_each_side_independently() {
        let current = RequestedAngles::new(0, 180);
        let target = RequestedAngles::new(120, 60);
        let p = plan(current, target, 2_000).unwrap();
        let mut acc = FaderAccumulator::start_from(current);
        let mut last = current;
        for step_idx in 0..p.steps {
            let (angles, _) = acc.step(p, step_idx);
            last = angles;
        }
        assert_eq!(last, target);
    }
}
