//! Crate-wide error type. `no_std`, so this is a plain enum rather than
//! anything implementing `std::error::Error` — formatted through `defmt`
//! for trace output instead.

#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum DriverError {
    /// A command's fields failed validation; the channel is left unchanged.
    Validation(ValidationError),
    /// The command transport (USB serial) isn't ready to accept a reply or
    /// couldn't deliver a request.
    TransportUnavailable,
    /// A channel's gate GPIO couldn't be reserved at init. The channel is
    /// marked disabled; other channels continue normally.
    GpioInit { channel: u8 },
    /// Calibration's std-dev check failed on at least one buffer. Non-fatal:
    /// the tracker runs in degraded mode with the default hysteresis.
    CalibrationUnstable,
    /// A phase worker hit its IRQ wait timeout. No pulses are issued for
    /// affected cycles; recovers automatically on the next edge.
    SyncLost,
    /// The zero-crossing IRQ couldn't be registered at init. Fatal.
    IrqRegistration,
}

#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum ValidationError {
    ChannelOutOfRange { channel: u8 },
    AngleOutOfRange { degrees: u16 },
}
