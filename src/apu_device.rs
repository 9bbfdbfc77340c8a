// Backend-agnostic APU sink trait.
//
// The engine does no sound synthesis of its own: every APU register write
// the 6502 performs is handed to an ApuSink, synchronously and in program
// order. Backends range from an I2C bridge to real 2A03 hardware to a
// software APU to a plain capture buffer in tests.

/// Common interface for APU write backends.
pub trait ApuSink: Send {
    /// One APU register write, `addr` in `$4000-$4017`.
    fn write(&mut self, addr: u16, value: u8);

    /// Silence the backend. Called when playback stops.
    fn reset(&mut self) {}
}

/// Sink that discards every write.
pub struct NullSink;

impl ApuSink for NullSink {
    fn write(&mut self, _addr: u16, _value: u8) {}
}

/// Wrapper that drops DMC control writes ($4010 rate, $4012 address,
/// $4013 length) on the way to the inner sink. Direct DAC writes to
/// $4011 still pass through. Useful for backends that cannot fetch
/// sample data.
pub struct DmcFilter<S: ApuSink>(pub S);

const DMC_CTRL: u16 = 0x4010;
const DMC_ADDR: u16 = 0x4012;
const DMC_LEN: u16 = 0x4013;

impl<S: ApuSink> ApuSink for DmcFilter<S> {
    fn write(&mut self, addr: u16, value: u8) {
        if addr != DMC_CTRL && addr != DMC_ADDR && addr != DMC_LEN {
            self.0.write(addr, value);
        }
    }

    fn reset(&mut self) {
        self.0.reset();
    }
}
