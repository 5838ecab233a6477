//! Frequency telemetry formatting: `NN.NNHz\n` when the tracker's period is
//! in bounds, `error\n` otherwise.

use heapless::String;

/// Formats the measured mains frequency from a zero-crossing period. `None`
/// (out of bounds, or tracker not yet live) formats as `error`.
pub fn format_frequency(period_ns_or_zero: u64) -> String<16> {
    let mut out = String::new();
    if period_ns_or_zero == 0 {
        let _ = out.push_str("error\n");
        return out;
    }

    // freq_hz_x100 = 100 * 1e9 / period_ns, rounded to nearest.
    let freq_hz_x100 = (100_000_000_000u64 + period_ns_or_zero / 2) / period_ns_or_zero;
    let whole = freq_hz_x100 / 100;
    let frac = freq_hz_x100 % 100;

    // `NN.NNHz`: two integer digits, so cap display at 99.99Hz even though
    // that can't happen within the valid period bounds.
    let whole = whole.min(99);
    let _ = core::fmt::write(&mut out, format_args!("{whole:02}.{frac:02}Hz\n"));
    out
}

/// Formats the raw calibration sample counts per half-cycle buffer, for the
/// diagnostic query. Counts keep accumulating via `CalibBuffer::len()` even
/// after calibration ends, so this remains queryable in `Live`/`Degraded`
/// mode as a record of what the calibration window actually saw.
pub fn format_calib_samples(pos: usize, neg: usize) -> String<32> {
    let mut out = String::new();
    let _ = core::fmt::write(&mut out, format_args!("pos={pos} neg={neg}\n"));
    out
}

/// Formats one channel's missed-cycle count, for the diagnostic query.
pub fn format_missed_cycles(count: u32) -> String<16> {
    let mut out = String::new();
    let _ = core::fmt::write(&mut out, format_args!("{count}\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifty_hertz_line() {
        assert_eq!(format_frequency(20_000_000).as_str(), "50.00Hz\n");
    }

    #[test]
    fn sixty_hertz_line() {
        // 16_666_666ns -> 60.0000...Hz, allow the spec's "+-1 in the last
        // digit" slack by checking the whole-Hz part and first decimal.
        let s = format_frequency(16_666_666);
        assert!(s.starts_with("60.0"));
        assert!(s.ends_with("Hz\n"));
    }

    #[test]
    fn zero_period_is_error() {
        assert_eq!(format_frequency(0).as_str(), "error\n");
    }

    #[test]
    fn calib_samples_line() {
        assert_eq!(format_calib_samples(250, 248).as_str(), "pos=250 neg=248\n");
    }

    #[test]
    fn missed_cycles_line() {
        assert_eq!(format_missed_cycles(3).as_str(), "3\n");
    }
}
