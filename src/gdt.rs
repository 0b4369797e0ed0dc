// GDT management. Slots 0..=3 are fixed (null, kernel code/data, the
// syscall call gate); the rest of the table is a pool handed out one
// descriptor at a time, mainly for per-task TSS descriptors and the two
// shared ring-3 app segments.

use crate::constants::*;
use crate::irq::consts::{GATE_DPL3, GATE_P_PRESENT, GATE_TYPE_SYSCALL};
use crate::x86;
use crate::x86::DescriptorTablePointer;
use consts::*;
use core::cell::UnsafeCell;
use spin::Mutex;

pub(crate) mod consts {
    // Segment descriptor attribute bits (the 16-bit attr field packs the
    // access byte, limit 16..19 and the flag nibble).
    pub(crate) const SEG_G: u16 = 1 << 15;
    pub(crate) const SEG_D: u16 = 1 << 14;
    pub(crate) const SEG_P_PRESENT: u16 = 1 << 7;
    pub(crate) const SEG_DPL0: u16 = 0 << 5;
    pub(crate) const SEG_DPL3: u16 = 3 << 5;
    pub(crate) const SEG_S_SYSTEM: u16 = 0 << 4;
    pub(crate) const SEG_S_NORMAL: u16 = 1 << 4;
    pub(crate) const SEG_TYPE_CODE: u16 = 1 << 3;
    pub(crate) const SEG_TYPE_DATA: u16 = 0 << 3;
    pub(crate) const SEG_TYPE_RW: u16 = 1 << 1;
    pub(crate) const SEG_TYPE_TSS: u16 = 9;
}

/// One GDT slot.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub(crate) struct SegDesc {
    limit15_0: u16,
    base15_0: u16,
    base23_16: u8,
    attr: u16,
    base31_24: u8,
}

impl SegDesc {
    const fn empty() -> SegDesc {
        SegDesc {
            limit15_0: 0,
            base15_0: 0,
            base23_16: 0,
            attr: 0,
            base31_24: 0,
        }
    }
}

/// The hardware task-state segment. One per task; `esp0`/`ss0` locate the
/// kernel stack entered on a ring crossing, `cr3` the address space.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct Tss {
    pub(crate) pre_link: u32,
    pub(crate) esp0: u32,
    pub(crate) ss0: u32,
    pub(crate) esp1: u32,
    pub(crate) ss1: u32,
    pub(crate) esp2: u32,
    pub(crate) ss2: u32,
    pub(crate) cr3: u32,
    pub(crate) eip: u32,
    pub(crate) eflags: u32,
    pub(crate) eax: u32,
    pub(crate) ecx: u32,
    pub(crate) edx: u32,
    pub(crate) ebx: u32,
    pub(crate) esp: u32,
    pub(crate) ebp: u32,
    pub(crate) esi: u32,
    pub(crate) edi: u32,
    pub(crate) es: u32,
    pub(crate) cs: u32,
    pub(crate) ss: u32,
    pub(crate) ds: u32,
    pub(crate) fs: u32,
    pub(crate) gs: u32,
    pub(crate) ldt: u32,
    pub(crate) iomap: u32,
}

impl Tss {
    pub(crate) const fn zeroed() -> Tss {
        Tss {
            pre_link: 0,
            esp0: 0,
            ss0: 0,
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            fs: 0,
            gs: 0,
            ldt: 0,
            iomap: 0,
        }
    }
}

struct GdtTable(UnsafeCell<[SegDesc; GDT_TABLE_SIZE]>);

// Mutated through set_desc during boot and task creation; the slot
// allocator below serialises writers.
unsafe impl Sync for GdtTable {}

static GDT: GdtTable = GdtTable(UnsafeCell::new([SegDesc::empty(); GDT_TABLE_SIZE]));

/// Allocation state for the dynamic slots. Slot i is free iff bit i is 0.
struct SlotMap {
    used: [u32; GDT_TABLE_SIZE / 32],
}

impl SlotMap {
    const fn new() -> SlotMap {
        SlotMap {
            used: [0; GDT_TABLE_SIZE / 32],
        }
    }

    fn alloc(&mut self, first: usize) -> Option<usize> {
        for i in first..GDT_TABLE_SIZE {
            if self.used[i / 32] & (1 << (i % 32)) == 0 {
                self.used[i / 32] |= 1 << (i % 32);
                return Some(i);
            }
        }
        None
    }

    fn free(&mut self, i: usize) {
        self.used[i / 32] &= !(1 << (i % 32));
    }
}

static SLOTS: Mutex<SlotMap> = Mutex::new(SlotMap::new());

const FIXED_SLOTS: usize = 4;

fn write_desc(index: usize, desc: SegDesc) {
    unsafe {
        (*GDT.0.get())[index] = desc;
    }
}

/// Install a normal or system segment descriptor at `selector`.
pub(crate) fn segment_desc_set(selector: u16, base: u32, limit: u32, mut attr: u16) {
    let mut limit = limit;
    if limit > 0xfffff {
        attr |= SEG_G;
        limit /= 0x1000;
    }
    write_desc(
        (selector >> 3) as usize,
        SegDesc {
            limit15_0: (limit & 0xffff) as u16,
            base15_0: (base & 0xffff) as u16,
            base23_16: ((base >> 16) & 0xff) as u8,
            attr: attr | (((limit >> 16) & 0xf) as u16) << 8,
            base31_24: ((base >> 24) & 0xff) as u8,
        },
    );
}

/// Install the syscall call gate at `selector`. A call gate shares the slot
/// format of an IDT gate; the low attr bits carry the parameter count the
/// processor copies to the kernel stack.
pub(crate) fn gate_desc_set(selector: u16, target_sel: u16, offset: u32, attr: u16) {
    let desc = crate::irq::GateDesc::new(target_sel, offset, attr);
    // Same slot size, different layout.
    write_desc(
        (selector >> 3) as usize,
        unsafe { core::mem::transmute::<crate::irq::GateDesc, SegDesc>(desc) },
    );
}

/// Take a free descriptor slot. Returns a selector.
pub(crate) fn gdt_alloc_desc() -> Option<u16> {
    let mut slots = SLOTS.lock();
    slots.alloc(FIXED_SLOTS).map(|i| (i * 8) as u16)
}

pub(crate) fn gdt_free_sel(selector: u16) {
    let index = (selector >> 3) as usize;
    if index < FIXED_SLOTS {
        return;
    }
    write_desc(index, SegDesc::empty());
    SLOTS.lock().free(index);
}

/// Point `selector` at a task's TSS image.
pub(crate) fn set_tss_desc(selector: u16, tss: &Tss) {
    segment_desc_set(
        selector,
        tss as *const Tss as u32,
        core::mem::size_of::<Tss>() as u32,
        SEG_P_PRESENT | SEG_DPL0 | SEG_S_SYSTEM | SEG_TYPE_TSS,
    );
}

/// Build the fixed descriptors, load the table, and reload the segment
/// registers with the new kernel selectors.
pub(crate) fn init(syscall_entry: u32) {
    {
        let mut slots = SLOTS.lock();
        for i in 0..FIXED_SLOTS {
            let taken = slots.alloc(i);
            debug_assert_eq!(taken, Some(i));
        }
    }

    segment_desc_set(
        KERNEL_SELECTOR_CS,
        0x0,
        0xffff_ffff,
        SEG_P_PRESENT | SEG_DPL0 | SEG_S_NORMAL | SEG_TYPE_CODE | SEG_TYPE_RW | SEG_D,
    );
    segment_desc_set(
        KERNEL_SELECTOR_DS,
        0x0,
        0xffff_ffff,
        SEG_P_PRESENT | SEG_DPL0 | SEG_S_NORMAL | SEG_TYPE_DATA | SEG_TYPE_RW | SEG_D,
    );
    gate_desc_set(
        SELECTOR_SYSCALL,
        KERNEL_SELECTOR_CS,
        syscall_entry,
        GATE_P_PRESENT | GATE_DPL3 | GATE_TYPE_SYSCALL | SYSCALL_PARAM_COUNT as u16,
    );

    let ptr = DescriptorTablePointer {
        limit: (core::mem::size_of::<[SegDesc; GDT_TABLE_SIZE]>() - 1) as u16,
        base: GDT.0.get() as u32,
    };
    x86::lgdt(&ptr);

    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!(
            "movw ${kds}, %ax",
            "movw %ax, %ds",
            "movw %ax, %es",
            "movw %ax, %ss",
            "movw %ax, %fs",
            "movw %ax, %gs",
            "pushl ${kcs}",
            "pushl $2f",
            "lret",
            "2:",
            kds = const KERNEL_SELECTOR_DS,
            kcs = const KERNEL_SELECTOR_CS,
            out("eax") _,
            options(att_syntax)
        );
    }
}
