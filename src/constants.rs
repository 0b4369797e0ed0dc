// Memory layout, segment selectors and table capacities shared across the
// kernel. Addresses are u32: this kernel only targets 32-bit protected mode.

pub(crate) const PGSIZE: u32 = 4096;
pub(crate) const PGSHIFT: u32 = 12;
pub(crate) const NPDENTRIES: usize = 1024;
pub(crate) const NPTENTRIES: usize = 1024;

// Physical pool handed to the page allocator: everything between the end of
// the kernel image (rounded up) and MEM_EXT_END.
pub(crate) const MEM_EXT_START: u32 = 0x0010_0000;
pub(crate) const MEM_EXT_END: u32 = 0x0800_0000;

/// Bottom of every user address space. The kernel owns [0, MEMORY_TASK_BASE)
/// and is mapped identically into all address spaces.
pub(crate) const MEMORY_TASK_BASE: u32 = 0x8000_0000;

pub(crate) const MEM_TASK_STACK_TOP: u32 = 0xE000_0000;
pub(crate) const MEM_TASK_STACK_SIZE: u32 = 500 * PGSIZE;
/// Room reserved at the stack top for the marshalled argv block.
pub(crate) const MEM_TASK_ARG_SIZE: u32 = 4 * 1024;

/// Bytes carved out of the physical pool for the kernel heap at boot.
pub(crate) const KERNEL_HEAP_SIZE: u32 = 1024 * 1024;

// Segment selectors. The first three GDT slots are fixed; everything after
// SELECTOR_SYSCALL is handed out by gdt_alloc_desc (app segments, TSSes).
pub(crate) const KERNEL_SELECTOR_CS: u16 = 8;
pub(crate) const KERNEL_SELECTOR_DS: u16 = 2 * 8;
pub(crate) const SELECTOR_SYSCALL: u16 = 3 * 8;
pub(crate) const GDT_TABLE_SIZE: usize = 256;

pub(crate) const SEG_RPL3: u16 = 3;

pub(crate) const EFLAGS_DEFAULT: u32 = 1 << 1;
pub(crate) const EFLAGS_IF: u32 = 1 << 9;

// Tasking.
pub(crate) const TASK_NR: usize = 128;
pub(crate) const TASK_NAME_SIZE: usize = 32;
pub(crate) const TASK_OFILE_NR: usize = 128;
pub(crate) const TASK_TIME_SLICE_DEFAULT: u32 = 10;
pub(crate) const IDLE_STACK_SIZE: usize = 1024;

/// Milliseconds per timer tick (100 Hz).
pub(crate) const OS_TICK_MS: u32 = 10;

// Files and filesystems.
pub(crate) const FILE_NAME_SIZE: usize = 32;
pub(crate) const FILE_TABLE_SIZE: usize = 2048;
pub(crate) const FS_TABLE_SIZE: usize = 10;
pub(crate) const FS_MOUNT_SIZE: usize = 64;

pub(crate) const SECTOR_SIZE: usize = 512;

// Device majors. ROOT_DEV selects sda1: disk index encoded as 0xa + disk,
// partition slot in the low nibble.
pub(crate) const DEV_TTY: u32 = 0;
pub(crate) const DEV_DISK: u32 = 1;
pub(crate) const ROOT_DEV_MAJOR: u32 = DEV_DISK;
pub(crate) const ROOT_DEV_MINOR: u32 = 0xa1;

pub(crate) const SYSCALL_PARAM_COUNT: u32 = 5;
