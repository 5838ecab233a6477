//! Per-channel state machine.
//!
//! Re-architected per the redesign notes against the reference design,
//! which interleaves state evaluation with direct GPIO/kernel calls: here
//! it's a pure function from `(status, requested angles, refresh)` to
//! `(next status, commands)`, with the coordinator executing the commands
//! against hardware outside the decision function. That keeps every branch
//! of the four-state table host-testable and removes the duplicated
//! per-status branches the original carries.

use crate::channel::{RequestedAngles, Status};
use heapless::Vec;

#[derive(Clone, Copy, PartialEq, Eq, defmt::Format, Debug)]
pub enum Command {
    StartWorker,
    StopWorker,
    WriteGateHigh,
    WriteGateLow,
    RecomputeNs,
}

pub type Commands = Vec<Command, 4>;

/// Outcome of one state machine evaluation: the channel's next status, the
/// commands the coordinator must execute, and whether the channel's
/// `refresh` flag was consumed (and should be cleared).
pub struct Outcome {
    pub next_status: Status,
    pub commands: Commands,
    pub clear_refresh: bool,
}

fn has_worker(status: Status) -> bool {
    matches!(status, Status::Symmetric | Status::Asymmetric)
}

/// Evaluates one channel's transition. `requested` is guard-snapped by the
/// caller before being passed in (callers should use
/// `RequestedAngles::guard_snapped`), matching the reference design's
/// "after guard-snapping" transition table.
pub fn evaluate(status: Status, requested: RequestedAngles, refresh: bool) -> Outcome {
    let mut commands = Commands::new();

    let next_status = if requested.is_off() {
        Status::Off
    } else if requested.is_on() {
        Status::On
    } else if requested.is_symmetric() {
        Status::Symmetric
    } else {
        Status::Asymmetric
    };

    let was_active = has_worker(status);
    let is_active = has_worker(next_status);

    if next_status != status {
        if is_active && !was_active {
            let _ = commands.push(Command::StartWorker);
        } else if !is_active && was_active {
            let _ = commands.push(Command::StopWorker);
        }

        match next_status {
            Status::Off => {
                let _ = commands.push(Command::WriteGateLow);
            }
            Status::On => {
                let _ = commands.push(Command::WriteGateHigh);
            }
            Status::Symmetric | Status::Asymmetric => {}
        }
    }

    // Recompute pos_ns/neg_ns whenever the channel is freshly active, or
    // stays active and was asked to refresh.
    let needs_recompute = is_active && (next_status != status || refresh);
    if needs_recompute {
        let _ = commands.push(Command::RecomputeNs);
    }

    Outcome {
        next_status,
        commands,
        clear_refresh: needs_recompute && refresh,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn angles(pos: u16, neg: u16) -> RequestedAngles {
        RequestedAngles::new(pos, neg)
    }

    #[test]
    fn off_to_off_is_a_no_op() {
        let o = evaluate(Status::Off, angles(0, 0), false);
        assert_eq!(o.next_status, Status::Off);
        assert!(o.commands.is_empty());
    }

    #[test]
    fn off_to_on() {
        let o = evaluate(Status::Off, angles(180, 180), false);
        assert_eq!(o.next_status, Status::On);
        assert_eq!(o.commands.as_slice(), &[Command::WriteGateHigh]);
    }

    #[test]
    fn on_to_off() {
        let o = evaluate(Status::On, angles(0, 0), false);
        assert_eq!(o.next_status, Status::Off);
        assert_eq!(o.commands.as_slice(), &[Command::WriteGateLow]);
    }

    #[test]
    fn off_to_symmetric_starts_worker() {
        let o = evaluate(Status::Off, angles(90, 90), false);
        assert_eq!(o.next_status, Status::Symmetric);
        assert_eq!(
            o.commands.as_slice(),
            &[Command::StartWorker, Command::RecomputeNs]
        );
    }

    #[test]
    fn off_to_asymmetric_starts_worker() {
        let o = evaluate(Status::Off, angles(90, 45), false);
        assert_eq!(o.next_status, Status::Asymmetric);
        assert_eq!(
            o.commands.as_slice(),
            &[Command::StartWorker, Command::RecomputeNs]
        );
    }

    #[test]
    fn symmetric_to_asymmetric_keeps_worker() {
        let o = evaluate(Status::Symmetric, angles(90, 45), false);
        assert_eq!(o.next_status, Status::Asymmetric);
        assert_eq!(o.commands.as_slice(), &[Command::RecomputeNs]);
    }

    #[test]
    fn asymmetric_to_symmetric_keeps_worker() {
        let o = evaluate(Status::Asymmetric, angles(60, 60), false);
        assert_eq!(o.next_status, Status::Symmetric);
        assert_eq!(o.commands.as_slice(), &[Command::RecomputeNs]);
    }

    #[test]
    fn symmetric_refresh_recomputes_and_clears_flag() {
        let o = evaluate(Status::Symmetric, angles(90, 90), true);
        assert_eq!(o.next_status, Status::Symmetric);
        assert_eq!(o.commands.as_slice(), &[Command::RecomputeNs]);
        assert!(o.clear_refresh);
    }

    #[test]
    fn symmetric_no_refresh_is_a_no_op() {
        let o = evaluate(Status::Symmetric, angles(90, 90), false);
        assert_eq!(o.next_status, Status::Symmetric);
        assert!(o.commands.is_empty());
        assert!(!o.clear_refresh);
    }

    #[test]
    fn symmetric_to_on_stops_worker() {
        let o = evaluate(Status::Symmetric, angles(180, 180), false);
        assert_eq!(o.next_status, Status::On);
        assert_eq!(
            o.commands.as_slice(),
            &[Command::StopWorker, Command::WriteGateHigh]
        );
    }

    #[test]
    fn asymmetric_to_off_stops_worker() {
        let o = evaluate(Status::Asymmetric, angles(0, 0), false);
        assert_eq!(o.next_status, Status::Off);
        assert_eq!(
            o.commands.as_slice(),
            &[Command::StopWorker, Command::WriteGateLow]
        );
    }

    #[test]
    fn near_edge_asymmetric_request_snaps_to_full_and_skip() {
        // (2, 178) guard-snaps to (0, 180): pos is pulse-skipped, neg is
        // effectively full conduction -- but since pos==0 and neg==180 this
        // is neither the all-zero OFF condition nor the all-180 ON
        // condition, so it lands as ASYM with one side suppressed.
        let snapped = angles(2, 178).guard_snapped();
        assert_eq!(snapped, angles(0, 180));
        let o = evaluate(Status::Off, snapped, false);
        assert_eq!(o.next_status, Status::Asymmetric);
    }
}
