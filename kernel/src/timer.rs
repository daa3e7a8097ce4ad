//! System tick timer
//!
//! The PIT drives channel 0 at a configurable rate (50 Hz by default); the
//! IRQ handler bumps a monotonic tick counter that the scheduler and sleep
//! timeouts are built on. Divisor math lives here so it can be checked on
//! the host; the actual port programming is in `arch::x86::pit`.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Base oscillator frequency of the 8253/8254 PIT.
pub const PIT_BASE_HZ: u32 = 1_193_182;

/// Default tick rate.
pub const DEFAULT_HZ: u32 = 50;

static TICKS: AtomicU64 = AtomicU64::new(0);
static FREQUENCY: AtomicU32 = AtomicU32::new(DEFAULT_HZ);

/// Ticks elapsed since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Record one timer tick (called from the timer IRQ). Returns the new count.
pub fn record_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Configured tick frequency in Hz.
pub fn frequency() -> u32 {
    FREQUENCY.load(Ordering::Relaxed)
}

/// Set the tick frequency. Called by `init_timer` before programming the PIT.
pub fn set_frequency(hz: u32) {
    FREQUENCY.store(hz, Ordering::Relaxed);
}

/// PIT channel-0 divisor for the requested rate.
///
/// Panics if the divisor does not fit in the PIT's 16-bit reload register;
/// that is a boot-time configuration error.
pub fn pit_divisor(hz: u32) -> u16 {
    let d = PIT_BASE_HZ / hz;
    if d & 0xFFFF != d {
        panic!("PIT divisor {d} for {hz} Hz does not fit in 16 bits");
    }
    d as u16
}

/// Convert a duration in milliseconds to ticks at the current rate,
/// rounding up so a sleep never returns early. Resolution is one tick.
pub fn ticks_for_ms(ms: u64) -> u64 {
    let hz = frequency() as u64;
    (ms * hz).div_ceil(1000)
}
