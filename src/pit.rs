// 8253 interval timer, channel 0: the OS tick (IRQ 0 → task_time_tick).

use crate::constants::OS_TICK_MS;
use crate::irq;
use crate::irq::consts::{IRQ_OFFSET, IRQ_TIMER};
use crate::x86;

const PIT_OSC_FREQ: u32 = 1_193_182;

const PIT_CHANNEL0_DATA_PORT: u16 = 0x40;
const PIT_COMMAND_MODE_PORT: u16 = 0x43;

const PIT_CHANNEL0: u8 = 0 << 6;
const PIT_LOAD_LOHI: u8 = 3 << 4;
const PIT_MODE3: u8 = 3 << 1;

/// Program a periodic tick of OS_TICK_MS and unmask the timer line.
pub(crate) fn init() {
    let reload = PIT_OSC_FREQ * OS_TICK_MS / 1000;

    x86::outb(
        PIT_COMMAND_MODE_PORT,
        PIT_CHANNEL0 | PIT_LOAD_LOHI | PIT_MODE3,
    );
    x86::outb(PIT_CHANNEL0_DATA_PORT, (reload & 0xff) as u8);
    x86::outb(PIT_CHANNEL0_DATA_PORT, ((reload >> 8) & 0xff) as u8);

    irq::enable(IRQ_OFFSET + IRQ_TIMER);
}
