//! Command intake: validates an incoming `PhaseCommand` before it's allowed
//! to touch channel state, the same shape the reference design's RC-link
//! validation in `safety.rs` uses for `ChannelData`.

use crate::config::MAX_CHANNELS;
use crate::error::{DriverError, ValidationError};
use packed_struct::prelude::*;

/// Wire command, `{channel, fade, time_ms, pos_deg, neg_deg}` per the
/// external command envelope. `channel` is 1-based on the wire, matching
/// the CLI surface (`-c <channel>`).
#[derive(PackedStruct, Clone, Copy, PartialEq, Eq, defmt::Format, Debug)]
#[packed_struct(bit_numbering = "msb0", endian = "msb")]
pub struct PhaseCommand {
    #[packed_field(bits = "0")]
    pub fade: bool,
    #[packed_field(bits = "1:7")]
    pub channel: u8,
    #[packed_field(bytes = "1:2")]
    pub time_ms: u16,
    #[packed_field(bytes = "3")]
    pub pos_deg: u8,
    #[packed_field(bytes = "4")]
    pub neg_deg: u8,
}

/// A command after validation, ready to apply to a channel. `channel_index`
/// is converted to 0-based.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format, Debug)]
pub struct ValidCommand {
    pub channel_index: u8,
    pub fade: bool,
    pub time_ms: u16,
    pub pos_deg: u16,
    pub neg_deg: u16,
}

/// `fade && duration_ms == 0` is a request to stop the channel's fader
/// immediately rather than start a new one.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format, Debug)]
pub enum Action {
    SetAngles(ValidCommand),
    StartFade(ValidCommand),
    StopFade { channel_index: u8 },
}

pub fn validate(cmd: PhaseCommand) -> Result<Action, DriverError> {
    if cmd.channel == 0 || cmd.channel as usize > MAX_CHANNELS {
        return Err(DriverError::Validation(ValidationError::ChannelOutOfRange {
            channel: cmd.channel,
        }));
    }
    if cmd.pos_deg > 180 {
        return Err(DriverError::Validation(ValidationError::AngleOutOfRange {
            degrees: cmd.pos_deg as u16,
        }));
    }
    if cmd.neg_deg > 180 {
        return Err(DriverError::Validation(ValidationError::AngleOutOfRange {
            degrees: cmd.neg_deg as u16,
        }));
    }

    let channel_index = cmd.channel - 1;
    let valid = ValidCommand {
        channel_index,
        fade: cmd.fade,
        time_ms: cmd.time_ms,
        pos_deg: cmd.pos_deg as u16,
        neg_deg: cmd.neg_deg as u16,
    };

    if !cmd.fade {
        return Ok(Action::SetAngles(valid));
    }

    if cmd.time_ms == 0 {
        return Ok(Action::StopFade { channel_index });
    }

    // time_ms > 0 here, so the "fade with a nonzero target needs a
    // duration" rule is already satisfied for every target, including a
    // fade down to (0, 0).
    Ok(Action::StartFade(valid))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(channel: u8, fade: bool, time_ms: u16, pos_deg: u8, neg_deg: u8) -> PhaseCommand {
        PhaseCommand {
            fade,
            channel,
            time_ms,
            pos_deg,
            neg_deg,
        }
    }

    #[test]
    fn rejects_out_of_range_channel() {
        assert!(matches!(
            validate(cmd(0, false, 0, 90, 90)),
            Err(DriverError::Validation(ValidationError::ChannelOutOfRange { channel: 0 }))
        ));
        assert!(matches!(
            validate(cmd(5, false, 0, 90, 90)),
            Err(DriverError::Validation(ValidationError::ChannelOutOfRange { channel: 5 }))
        ));
    }

    #[test]
    fn rejects_out_of_range_angle() {
        assert!(matches!(
            validate(cmd(1, false, 0, 200, 90)),
            Err(DriverError::Validation(ValidationError::AngleOutOfRange { .. }))
        ));
    }

    #[test]
    fn no_fade_sets_angles_directly() {
        match validate(cmd(1, false, 0, 90, 90)) {
            Ok(Action::SetAngles(v)) => {
                assert_eq!(v.channel_index, 0);
                assert_eq!(v.pos_deg, 90);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn fade_with_zero_duration_stops_fader() {
        match validate(cmd(2, true, 0, 90, 90)) {
            Ok(Action::StopFade { channel_index }) => assert_eq!(channel_index, 1),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn fade_with_duration_starts_fade() {
        match validate(cmd(3, true, 5_000, 110, 110)) {
            Ok(Action::StartFade(v)) => assert_eq!(v.time_ms, 5_000),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
