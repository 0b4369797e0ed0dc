// Kernel log sink and the write path behind the tty devices. Everything
// funnels into the COM1 writer; interrupts are masked around the lock so an
// IRQ handler logging mid-print cannot deadlock on it.

use crate::irq;
use crate::serial::Serial;
use core::fmt;
use core::fmt::Write;
use spin::Mutex;
use spin::Once;

static CONSOLE: Once<Mutex<Serial>> = Once::new();

fn console() -> &'static Mutex<Serial> {
    CONSOLE.call_once(|| Mutex::new(Serial::init()))
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!($($arg)*))
    }
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let state = irq::enter_protection();
    let _ = console().lock().write_fmt(args);
    irq::leave_protection(state);
}

/// Raw byte output for the tty devices.
pub(crate) fn write_bytes(buf: &[u8]) -> usize {
    let state = irq::enter_protection();
    let serial = console().lock();
    for &b in buf {
        serial.write_byte(b);
    }
    irq::leave_protection(state);
    buf.len()
}

/// Back end of the PRINT_MSG syscall: a C-style format string with a single
/// argument. Only %d and %x are understood; anything else is echoed
/// verbatim.
pub(crate) fn print_msg(fmt: &[u8], arg: u32) {
    let state = irq::enter_protection();
    let mut serial = console().lock();

    let mut i = 0;
    while i < fmt.len() {
        let c = fmt[i];
        if c == b'%' && i + 1 < fmt.len() {
            i += 2;
            match fmt[i - 1] {
                b'd' => {
                    let _ = write!(serial, "{}", arg as i32);
                }
                b'x' => {
                    let _ = write!(serial, "{:x}", arg);
                }
                other => {
                    serial.write_byte(b'%');
                    serial.write_byte(other);
                }
            }
        } else {
            serial.write_byte(c);
            i += 1;
        }
    }
    serial.write_byte(b'\n');
    irq::leave_protection(state);
}
