//! VGA text console
//!
//! Global writer over the hardware text buffer at 0xB8000, plus the
//! hardware cursor update. All terminal logic lives in `crate::terminal`.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use x86::io::outb;

use crate::terminal::{make_color, Color, Terminal, TextBuffer, TEXT_WIDTH};

lazy_static! {
    pub static ref WRITER: Mutex<Terminal> = Mutex::new(Terminal::new(
        // SAFETY: 0xB8000 is the identity-mapped VGA text buffer and
        // nothing else aliases it.
        unsafe { &mut *(0xB8000 as *mut TextBuffer) },
        make_color(Color::LightGrey, Color::Black),
    ));
}

/// Move the hardware cursor to the terminal's position.
fn update_cursor(term: &Terminal) {
    let (row, col) = term.cursor();
    let pos = (row * TEXT_WIDTH + col) as u16;
    // SAFETY: Ports 0x3D4/0x3D5 are the VGA CRT controller registers.
    unsafe {
        outb(0x3D4, 14);
        outb(0x3D5, (pos >> 8) as u8);
        outb(0x3D4, 15);
        outb(0x3D5, pos as u8);
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    // The writer is shared with interrupt-context printing; mask while
    // the lock is held.
    let _guard = crate::sync::hold_interrupts();
    let mut writer = WRITER.lock();
    writer.write_fmt(args).ok();
    update_cursor(&writer);
}

/// Change the console foreground color.
pub fn set_text_color(fg: Color) {
    let _guard = crate::sync::hold_interrupts();
    WRITER.lock().set_text_color(fg);
}

/// Clear the console.
pub fn clear() {
    let _guard = crate::sync::hold_interrupts();
    let mut writer = WRITER.lock();
    writer.clear();
    update_cursor(&writer);
}
