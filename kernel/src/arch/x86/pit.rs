//! Programmable interval timer (channel 0)

use x86::io::outb;

use crate::timer;

const PIT_CMD: u16 = 0x43;
const PIT_CH0_DATA: u16 = 0x40;

/// Program channel 0 as a rate generator at `hz` and record the tick
/// frequency for sleep conversions.
pub fn init(hz: u32) {
    let divisor = timer::pit_divisor(hz);
    timer::set_frequency(hz);

    // SAFETY: Channel 0, lobyte/hibyte access, rate generator; the two
    // data writes follow the command as the 8253 requires.
    unsafe {
        outb(PIT_CMD, 0x36);
        outb(PIT_CH0_DATA, (divisor & 0xFF) as u8);
        outb(PIT_CH0_DATA, (divisor >> 8) as u8);
    }
    log::info!("pit: {hz} Hz (divisor {divisor})");
}
