// IDT setup and the common trap path. Every vector funnels through one asm
// trampoline (`alltraps`) that materialises an ExceptionFrame on the current
// kernel stack and calls into `do_handler_trap`.
//
// enter_protection / leave_protection are the critical-section primitive the
// scheduler and list code rely on: save EFLAGS, clear IF, restore on leave.
// Sections nest because each caller keeps its own saved state.

use crate::constants::*;
use crate::picirq;
use crate::x86;
use crate::x86::DescriptorTablePointer;
use consts::*;
use core::cell::UnsafeCell;

pub(crate) mod consts {
    // Processor-defined exception vectors.
    pub(crate) const T_DIVIDE: u32 = 0; // divide error
    pub(crate) const T_DEBUG: u32 = 1; // debug exception
    pub(crate) const T_NMI: u32 = 2; // non-maskable interrupt
    pub(crate) const T_BRKPT: u32 = 3; // breakpoint
    pub(crate) const T_OFLOW: u32 = 4; // overflow
    pub(crate) const T_BOUND: u32 = 5; // bounds check
    pub(crate) const T_ILLOP: u32 = 6; // illegal opcode
    pub(crate) const T_DEVICE: u32 = 7; // device not available
    pub(crate) const T_DBLFLT: u32 = 8; // double fault
    pub(crate) const T_COPROC: u32 = 9; // reserved
    pub(crate) const T_TSS: u32 = 10; // invalid task switch segment
    pub(crate) const T_SEGNP: u32 = 11; // segment not present
    pub(crate) const T_STACK: u32 = 12; // stack exception
    pub(crate) const T_GPFLT: u32 = 13; // general protection fault
    pub(crate) const T_PGFLT: u32 = 14; // page fault
    pub(crate) const T_RES: u32 = 15; // reserved
    pub(crate) const T_FPERR: u32 = 16; // floating point error
    pub(crate) const T_ALIGN: u32 = 17; // alignment check
    pub(crate) const T_MCHK: u32 = 18; // machine check
    pub(crate) const T_SIMDERR: u32 = 19; // SIMD floating point error

    /// Hardware IRQ lines arrive as IRQ_OFFSET + line.
    pub(crate) const IRQ_OFFSET: u32 = 0x20;
    pub(crate) const IRQ_TIMER: u32 = 0;
    pub(crate) const IRQ_IDE: u32 = 14;

    pub(crate) const NVECTORS: usize = 48;
    pub(crate) const IDT_TABLE_NR: usize = 128;

    // GP error code decode.
    pub(crate) const ERR_EXT: u32 = 1 << 0;
    pub(crate) const ERR_IDT: u32 = 1 << 1;

    // Page fault error code decode.
    pub(crate) const ERR_PAGE_P: u32 = 1 << 0;
    pub(crate) const ERR_PAGE_WR: u32 = 1 << 1;
    pub(crate) const ERR_PAGE_US: u32 = 1 << 2;

    // Gate attribute bits.
    pub(crate) const GATE_P_PRESENT: u16 = 1 << 15;
    pub(crate) const GATE_DPL0: u16 = 0 << 13;
    pub(crate) const GATE_DPL3: u16 = 3 << 13;
    pub(crate) const GATE_TYPE_INT: u16 = 0xe << 8;
    pub(crate) const GATE_TYPE_SYSCALL: u16 = 0xc << 8;
}

pub(crate) type IrqState = u32;

/// Enter a critical section: no interrupt handler and no preemption until
/// the matching leave_protection.
#[inline]
pub(crate) fn enter_protection() -> IrqState {
    let state = x86::read_eflags();
    x86::cli();
    state
}

#[inline]
pub(crate) fn leave_protection(state: IrqState) {
    x86::write_eflags(state);
}

/// One IDT slot.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct GateDesc {
    offset15_0: u16,
    selector: u16,
    attr: u16,
    offset31_16: u16,
}

impl GateDesc {
    pub(crate) const fn empty() -> GateDesc {
        GateDesc {
            offset15_0: 0,
            selector: 0,
            attr: 0,
            offset31_16: 0,
        }
    }

    pub(crate) fn new(selector: u16, offset: u32, attr: u16) -> GateDesc {
        GateDesc {
            offset15_0: (offset & 0xffff) as u16,
            selector,
            attr,
            offset31_16: (offset >> 16) as u16,
        }
    }
}

struct IdtTable(UnsafeCell<[GateDesc; IDT_TABLE_NR]>);

// Written once during single-threaded boot, read by the CPU afterwards.
unsafe impl Sync for IdtTable {}

static IDT: IdtTable = IdtTable(UnsafeCell::new([GateDesc::empty(); IDT_TABLE_NR]));

/// Registers captured by the trap trampoline, lowest address first.
#[repr(C)]
pub(crate) struct ExceptionFrame {
    pub(crate) gs: u32,
    pub(crate) fs: u32,
    pub(crate) es: u32,
    pub(crate) ds: u32,
    pub(crate) edi: u32,
    pub(crate) esi: u32,
    pub(crate) ebp: u32,
    pub(crate) esp_dummy: u32, // esp as saved by pushal, not meaningful
    pub(crate) ebx: u32,
    pub(crate) edx: u32,
    pub(crate) ecx: u32,
    pub(crate) eax: u32,
    pub(crate) num: u32,
    pub(crate) error_code: u32,
    // Pushed by the processor.
    pub(crate) eip: u32,
    pub(crate) cs: u32,
    pub(crate) eflags: u32,
    // Only present when the trap crossed from ring 3.
    pub(crate) esp3: u32,
    pub(crate) ss3: u32,
}

// Per-vector entry stubs. Vectors without a hardware error code push a zero
// so the frame layout is uniform; all of them fall into alltraps.
#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    r#"
    .macro VECTOR num
    vector\num:
        pushl $0
        pushl $\num
        jmp alltraps
    .endm
    .macro VECTOR_ERR num
    vector\num:
        pushl $\num
        jmp alltraps
    .endm

    .text
    VECTOR 0
    VECTOR 1
    VECTOR 2
    VECTOR 3
    VECTOR 4
    VECTOR 5
    VECTOR 6
    VECTOR 7
    VECTOR_ERR 8
    VECTOR 9
    VECTOR_ERR 10
    VECTOR_ERR 11
    VECTOR_ERR 12
    VECTOR_ERR 13
    VECTOR_ERR 14
    VECTOR 15
    VECTOR 16
    VECTOR_ERR 17
    VECTOR 18
    VECTOR 19
    VECTOR 20
    VECTOR 21
    VECTOR 22
    VECTOR 23
    VECTOR 24
    VECTOR 25
    VECTOR 26
    VECTOR 27
    VECTOR 28
    VECTOR 29
    VECTOR 30
    VECTOR 31
    VECTOR 32
    VECTOR 33
    VECTOR 34
    VECTOR 35
    VECTOR 36
    VECTOR 37
    VECTOR 38
    VECTOR 39
    VECTOR 40
    VECTOR 41
    VECTOR 42
    VECTOR 43
    VECTOR 44
    VECTOR 45
    VECTOR 46
    VECTOR 47

    alltraps:
        pushal
        pushl %ds
        pushl %es
        pushl %fs
        pushl %gs
        movw $0x10, %ax
        movw %ax, %ds
        movw %ax, %es
        pushl %esp
        call do_handler_trap
        addl $4, %esp
        popl %gs
        popl %fs
        popl %es
        popl %ds
        popal
        addl $8, %esp
        iretl

    .section .rodata
    .globl vectors
    vectors:
        .long vector0, vector1, vector2, vector3, vector4, vector5
        .long vector6, vector7, vector8, vector9, vector10, vector11
        .long vector12, vector13, vector14, vector15, vector16, vector17
        .long vector18, vector19, vector20, vector21, vector22, vector23
        .long vector24, vector25, vector26, vector27, vector28, vector29
        .long vector30, vector31, vector32, vector33, vector34, vector35
        .long vector36, vector37, vector38, vector39, vector40, vector41
        .long vector42, vector43, vector44, vector45, vector46, vector47
    .text
    "#,
    options(att_syntax)
);

/// Point every known vector at its stub and load the IDT.
pub(crate) fn init() {
    #[cfg(target_arch = "x86")]
    {
        extern "C" {
            static vectors: [u32; NVECTORS];
        }

        let idt = IDT.0.get();
        unsafe {
            for (i, &off) in vectors.iter().enumerate() {
                (*idt)[i] = GateDesc::new(
                    KERNEL_SELECTOR_CS,
                    off,
                    GATE_P_PRESENT | GATE_DPL0 | GATE_TYPE_INT,
                );
            }
        }
    }

    let ptr = DescriptorTablePointer {
        limit: (core::mem::size_of::<[GateDesc; IDT_TABLE_NR]>() - 1) as u16,
        base: IDT.0.get() as u32,
    };
    x86::lidt(&ptr);

    picirq::init();
}

pub(crate) fn enable(vector: u32) {
    picirq::enable(vector as u8);
}

#[allow(dead_code)]
pub(crate) fn disable(vector: u32) {
    picirq::disable(vector as u8);
}

fn trap_name(num: u32) -> &'static str {
    match num {
        T_DIVIDE => "Divide error",
        T_DEBUG => "Debug",
        T_NMI => "NMI Interrupt",
        T_BRKPT => "Breakpoint",
        T_OFLOW => "Overflow",
        T_BOUND => "BOUND Range Exceeded",
        T_ILLOP => "Invalid Opcode",
        T_DEVICE => "Device Not Available",
        T_DBLFLT => "Double Fault",
        T_COPROC => "Coprocessor Segment Overrun",
        T_TSS => "Invalid TSS",
        T_SEGNP => "Segment Not Present",
        T_STACK => "Stack-Segment Fault",
        T_GPFLT => "General Protection",
        T_PGFLT => "Page Fault",
        T_RES => "(reserved)",
        T_FPERR => "x87 FPU Floating-Point Error",
        T_ALIGN => "Alignment Check",
        T_MCHK => "Machine Check",
        T_SIMDERR => "SIMD Floating-Point Exception",
        _ => "(unknown trap)",
    }
}

fn dump_core_regs(frame: &ExceptionFrame) {
    let (ss, esp) = if frame.cs & 0x3 != 0 {
        (frame.ss3, frame.esp3)
    } else {
        (frame.ds, frame.esp_dummy)
    };
    println!("trap {} ({}), error code {:#x}", frame.num, trap_name(frame.num), frame.error_code);
    println!(
        "  cs {:#x} ds {:#x} es {:#x} fs {:#x} gs {:#x} ss {:#x}",
        frame.cs, frame.ds, frame.es, frame.fs, frame.gs, ss
    );
    println!(
        "  eax {:#010x} ebx {:#010x} ecx {:#010x} edx {:#010x}",
        frame.eax, frame.ebx, frame.ecx, frame.edx
    );
    println!(
        "  edi {:#010x} esi {:#010x} ebp {:#010x} esp {:#010x}",
        frame.edi, frame.esi, frame.ebp, esp
    );
    println!("  eip {:#010x} eflags {:#010x}", frame.eip, frame.eflags);
}

fn do_default_handler(frame: &ExceptionFrame) -> ! {
    println!("--------------------------------");
    println!("exception: {}", trap_name(frame.num));
    dump_core_regs(frame);
    loop {
        x86::hlt();
    }
}

/// A GP fault from ring 3 kills the offending task; anything else is fatal.
fn do_handler_general_protection(frame: &ExceptionFrame) {
    println!("--------------------------------");
    println!("exception: General Protection");
    if frame.error_code & ERR_EXT != 0 {
        println!("  raised while delivering an external event");
    }
    if frame.error_code & ERR_IDT != 0 {
        println!("  selector index refers to the IDT");
    }
    println!("  selector: {:#x}", frame.error_code & 0xfff8);
    dump_core_regs(frame);

    if frame.cs & 0x3 != 0 {
        crate::task::sys_exit(frame.error_code as i32);
    }
    loop {
        x86::hlt();
    }
}

/// No paging recovery: decode, dump and halt.
fn do_handler_page_fault(frame: &ExceptionFrame) -> ! {
    println!("--------------------------------");
    println!("exception: Page Fault at {:#010x}", x86::rcr2());
    if frame.error_code & ERR_PAGE_P != 0 {
        println!("  page-level protection violation");
    } else {
        println!("  page not present");
    }
    if frame.error_code & ERR_PAGE_WR != 0 {
        println!("  caused by a write");
    } else {
        println!("  caused by a read");
    }
    if frame.error_code & ERR_PAGE_US != 0 {
        println!("  from user mode");
    } else {
        println!("  from supervisor mode");
    }
    dump_core_regs(frame);
    loop {
        x86::hlt();
    }
}

/// Common trap entry, called from alltraps with interrupts disabled.
#[no_mangle]
extern "C" fn do_handler_trap(frame: *mut ExceptionFrame) {
    let frame = unsafe { &mut *frame };

    match frame.num {
        n if n == IRQ_OFFSET + IRQ_TIMER => {
            picirq::send_eoi((IRQ_OFFSET + IRQ_TIMER) as u8);
            crate::task::task_time_tick();
        }
        n if n == IRQ_OFFSET + IRQ_IDE => {
            crate::ide::do_handler_ide_primary();
        }
        T_GPFLT => do_handler_general_protection(frame),
        T_PGFLT => do_handler_page_fault(frame),
        n if n >= IRQ_OFFSET && n < IRQ_OFFSET + 16 => {
            // Spurious or unclaimed hardware interrupt.
            picirq::send_eoi(n as u8);
        }
        _ => do_default_handler(frame),
    }
}
