// Process table and scheduler.
//
// Tasks live in a fixed arena; slot 0 is the statically created idle task,
// slot 1 the first (init) task, and everything else is handed out by fork.
// A slot is free iff its pid is 0; pids themselves come from a monotonic
// counter. The ready and sleep lists are FIFO index queues over the arena;
// the arena doubles as the all-tasks list. The running task stays at the
// head of the ready list, and round-robin is remove + reinsert at the tail.
//
// Everything here is guarded by irq critical sections; the table mutex only
// serialises slot allocation and the zombie scans of wait/exit.

use crate::constants::*;
use crate::elf::{Elf32Ehdr, Elf32Phdr, PT_LOAD};
use crate::file::FileId;
use crate::gdt::consts::*;
use crate::gdt::{self, Tss};
use crate::irq;
use crate::pmap::{self, PageDir, PhysAddr, PteFlags};
use crate::sync::Mutex;
use crate::syscall::SyscallFrame;
use crate::util;
use crate::x86;
use crate::{file, fs};
use core::cell::UnsafeCell;

pub(crate) const TASK_FLAGS_SYSTEM: u32 = 1 << 0;

const IDLE: TaskId = TaskId(0);
const FIRST: TaskId = TaskId(1);
/// First slot fork may use.
const DYN_BASE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Created,
    Ready,
    Running,
    Sleeping,
    Waiting,
    Zombie,
}

/// Fixed-capacity FIFO of task ids, used for the ready and sleep lists and
/// the wait queues of the sync primitives.
pub(crate) struct TaskQueue {
    items: [TaskId; TASK_NR],
    len: usize,
}

impl TaskQueue {
    pub(crate) const fn new() -> TaskQueue {
        TaskQueue {
            items: [TaskId(0); TASK_NR],
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn push(&mut self, id: TaskId) {
        debug_assert!(self.len < TASK_NR, "task queue overflow");
        debug_assert!(!self.contains(id), "task already queued");
        self.items[self.len] = id;
        self.len += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<TaskId> {
        if self.len == 0 {
            return None;
        }
        Some(self.remove_at(0))
    }

    pub(crate) fn front(&self) -> Option<TaskId> {
        if self.len == 0 {
            None
        } else {
            Some(self.items[0])
        }
    }

    pub(crate) fn get(&self, i: usize) -> TaskId {
        debug_assert!(i < self.len);
        self.items[i]
    }

    pub(crate) fn remove_at(&mut self, i: usize) -> TaskId {
        debug_assert!(i < self.len);
        let id = self.items[i];
        for j in i..self.len - 1 {
            self.items[j] = self.items[j + 1];
        }
        self.len -= 1;
        id
    }

    /// Remove by id; false if not queued.
    pub(crate) fn remove(&mut self, id: TaskId) -> bool {
        for i in 0..self.len {
            if self.items[i] == id {
                self.remove_at(i);
                return true;
            }
        }
        false
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.items[..self.len].contains(&id)
    }
}

/// One process.
#[derive(Clone, Copy)]
pub(crate) struct Task {
    pid: u32, // 0 = slot free
    name: [u8; TASK_NAME_SIZE],
    state: TaskState,
    time_ticks: u32,
    slice_ticks: u32,
    sleep_ticks: u32,
    status: i32,
    parent: Option<TaskId>,
    tss: Tss,
    tss_sel: u16,
    heap_start: u32,
    heap_end: u32,
    file_table: [Option<FileId>; TASK_OFILE_NR],
}

impl Task {
    const fn zeroed() -> Task {
        Task {
            pid: 0,
            name: [0; TASK_NAME_SIZE],
            state: TaskState::Created,
            time_ticks: 0,
            slice_ticks: 0,
            sleep_ticks: 0,
            status: 0,
            parent: None,
            tss: Tss::zeroed(),
            tss_sel: 0,
            heap_start: 0,
            heap_end: 0,
            file_table: [None; TASK_OFILE_NR],
        }
    }

    fn page_dir(&self) -> PageDir {
        PageDir(PhysAddr(self.tss.cr3))
    }
}

struct TaskManager {
    tasks: [Task; TASK_NR],
    ready: TaskQueue,
    sleeping: TaskQueue,
    curr: Option<TaskId>,
    next_pid: u32,
    app_code_sel: u16,
    app_data_sel: u16,
}

impl TaskManager {
    const fn new() -> TaskManager {
        TaskManager {
            tasks: [Task::zeroed(); TASK_NR],
            ready: TaskQueue::new(),
            sleeping: TaskQueue::new(),
            curr: None,
            next_pid: 1,
            app_code_sel: 0,
            app_data_sel: 0,
        }
    }

    fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.0]
    }

    fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[id.0]
    }

    /// Append to the ready list. The idle task is never queued; it runs
    /// only when the list is empty.
    fn set_ready(&mut self, id: TaskId) {
        if id == IDLE {
            return;
        }
        self.ready.push(id);
        self.task_mut(id).state = TaskState::Ready;
    }

    fn set_block(&mut self, id: TaskId) {
        if id == IDLE {
            return;
        }
        self.ready.remove(id);
    }

    fn set_sleep(&mut self, id: TaskId, ticks: u32) {
        if ticks == 0 {
            return;
        }
        let task = self.task_mut(id);
        task.sleep_ticks = ticks;
        task.state = TaskState::Sleeping;
        self.sleeping.push(id);
    }

    fn next_run(&self) -> TaskId {
        self.ready.front().unwrap_or(IDLE)
    }

    /// Per-tick bookkeeping: round-robin on slice expiry, wake elapsed
    /// sleepers. The actual dispatch happens in the caller.
    fn tick_bookkeeping(&mut self) {
        let curr = match self.curr {
            Some(curr) => curr,
            None => return,
        };

        let task = self.task_mut(curr);
        task.slice_ticks = task.slice_ticks.saturating_sub(1);
        if task.slice_ticks == 0 {
            task.slice_ticks = task.time_ticks;
            self.set_block(curr);
            self.set_ready(curr);
        }

        let mut i = 0;
        while i < self.sleeping.len() {
            let id = self.sleeping.get(i);
            let task = self.task_mut(id);
            task.sleep_ticks -= 1;
            if task.sleep_ticks == 0 {
                self.sleeping.remove_at(i);
                self.set_ready(id);
            } else {
                i += 1;
            }
        }
    }

    fn alloc_pid(&mut self) -> u32 {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }
}

struct TmCell(UnsafeCell<TaskManager>);

// Single CPU; all mutation happens inside irq critical sections.
unsafe impl Sync for TmCell {}

static TASK_MANAGER: TmCell = TmCell(UnsafeCell::new(TaskManager::new()));

static TABLE_MUTEX: Mutex = Mutex::new();

fn tm() -> &'static mut TaskManager {
    unsafe { &mut *TASK_MANAGER.0.get() }
}

struct IdleStack(UnsafeCell<[u32; IDLE_STACK_SIZE]>);
unsafe impl Sync for IdleStack {}
static IDLE_STACK: IdleStack = IdleStack(UnsafeCell::new([0; IDLE_STACK_SIZE]));

fn idle_task_entry() -> ! {
    loop {
        x86::hlt();
    }
}

// Task lifecycle ----------------------------------------------------------

/// Build the TSS for a task: a GDT slot, a kernel stack page, the segment
/// selectors for its privilege level and a fresh address space.
fn tss_init(id: TaskId, flag: u32, entry: u32, esp: u32) -> Result<(), ()> {
    let tss_sel = match gdt::gdt_alloc_desc() {
        Some(sel) => sel,
        None => {
            println!("alloc tss failed");
            return Err(());
        }
    };

    let manager = tm();
    let task = manager.task_mut(id);
    task.tss = Tss::zeroed();

    let kernel_stack = match pmap::memory_alloc_page() {
        Some(pa) => pa.0,
        None => {
            gdt::gdt_free_sel(tss_sel);
            return Err(());
        }
    };

    let (code_sel, data_sel) = if flag & TASK_FLAGS_SYSTEM != 0 {
        (KERNEL_SELECTOR_CS as u32, KERNEL_SELECTOR_DS as u32)
    } else {
        (
            (manager.app_code_sel | SEG_RPL3) as u32,
            (manager.app_data_sel | SEG_RPL3) as u32,
        )
    };

    let task = manager.task_mut(id);
    task.tss.eip = entry;
    task.tss.esp = esp;
    task.tss.esp0 = kernel_stack + PGSIZE;
    task.tss.ss = data_sel;
    task.tss.ss0 = KERNEL_SELECTOR_DS as u32;
    task.tss.es = data_sel;
    task.tss.ds = data_sel;
    task.tss.fs = data_sel;
    task.tss.gs = data_sel;
    task.tss.cs = code_sel;
    task.tss.eflags = EFLAGS_DEFAULT | EFLAGS_IF;

    let page_dir = match PageDir::create_uvm() {
        Some(dir) => dir,
        None => {
            gdt::gdt_free_sel(tss_sel);
            pmap::memory_free_page(PhysAddr(kernel_stack));
            return Err(());
        }
    };
    task.tss.cr3 = page_dir.0 .0;
    task.tss_sel = tss_sel;

    gdt::set_tss_desc(tss_sel, &task.tss);
    Ok(())
}

pub(crate) fn task_init(id: TaskId, name: &[u8], flag: u32, entry: u32, esp: u32) -> Result<(), ()> {
    tss_init(id, flag, entry, esp)?;

    let state = irq::enter_protection();
    let manager = tm();
    let pid = manager.alloc_pid();
    let task = manager.task_mut(id);

    util::copy_name(&mut task.name, name);
    task.state = TaskState::Created;
    task.time_ticks = TASK_TIME_SLICE_DEFAULT;
    task.slice_ticks = task.time_ticks;
    task.sleep_ticks = 0;
    task.status = 0;
    task.pid = pid;
    task.parent = None;
    task.heap_start = 0;
    task.heap_end = 0;
    task.file_table = [None; TASK_OFILE_NR];
    irq::leave_protection(state);

    Ok(())
}

pub(crate) fn task_start(id: TaskId) {
    let state = irq::enter_protection();
    tm().set_ready(id);
    irq::leave_protection(state);
}

/// Release everything a dead task owned and clear the slot. The kernel
/// stack is freed against esp0, the address of its one page.
fn task_uninit(id: TaskId) {
    let task = tm().task_mut(id);

    if task.tss_sel != 0 {
        gdt::gdt_free_sel(task.tss_sel);
    }
    if task.tss.esp0 != 0 {
        pmap::memory_free_page(PhysAddr(task.tss.esp0 - PGSIZE));
    }
    if task.tss.cr3 != 0 {
        task.page_dir().destroy_uvm();
    }

    *task = Task::zeroed();
}

// Scheduler ----------------------------------------------------------------

pub(crate) fn task_current() -> Option<TaskId> {
    tm().curr
}

pub(crate) fn task_set_ready(id: TaskId) {
    let state = irq::enter_protection();
    tm().set_ready(id);
    irq::leave_protection(state);
}

pub(crate) fn task_set_block(id: TaskId) {
    let state = irq::enter_protection();
    tm().set_block(id);
    irq::leave_protection(state);
}

pub(crate) fn task_set_state(id: TaskId, new_state: TaskState) {
    let state = irq::enter_protection();
    tm().task_mut(id).state = new_state;
    irq::leave_protection(state);
}

/// Switch to the head of the ready list (or idle). No-op when that task is
/// already running.
pub(crate) fn task_dispatch() {
    let state = irq::enter_protection();
    let manager = tm();
    let to = manager.next_run();
    if Some(to) != manager.curr {
        manager.curr = Some(to);
        manager.task_mut(to).state = TaskState::Running;
        let tss_sel = manager.task(to).tss_sel;
        x86::far_jump(tss_sel);
    }
    irq::leave_protection(state);
}

/// Timer tick: charge the running task's slice, wake elapsed sleepers,
/// reschedule.
pub(crate) fn task_time_tick() {
    let state = irq::enter_protection();
    tm().tick_bookkeeping();
    task_dispatch();
    irq::leave_protection(state);
}

pub(crate) fn sys_sched_yield() -> i32 {
    let state = irq::enter_protection();
    let manager = tm();
    if manager.ready.len() > 1 {
        let curr = manager.curr.expect("yield without a current task");
        manager.set_block(curr);
        manager.set_ready(curr);
        task_dispatch();
    }
    irq::leave_protection(state);
    0
}

pub(crate) fn sys_msleep(ms: u32) {
    let ms = core::cmp::max(ms, OS_TICK_MS);
    let ticks = (ms + OS_TICK_MS - 1) / OS_TICK_MS;

    let state = irq::enter_protection();
    let manager = tm();
    let curr = manager.curr.expect("sleep without a current task");
    manager.set_block(curr);
    manager.set_sleep(curr, ticks);
    task_dispatch();
    irq::leave_protection(state);
}

pub(crate) fn sys_getpid() -> i32 {
    let manager = tm();
    let curr = manager.curr.expect("getpid without a current task");
    manager.task(curr).pid as i32
}

// File descriptors -----------------------------------------------------------

pub(crate) fn task_file(fd: i32) -> Option<FileId> {
    if fd < 0 || fd as usize >= TASK_OFILE_NR {
        return None;
    }
    let curr = task_current()?;
    tm().task(curr).file_table[fd as usize]
}

/// Smallest free descriptor slot of the current task.
pub(crate) fn task_alloc_fd(file_id: FileId) -> Option<i32> {
    let curr = task_current()?;
    let state = irq::enter_protection();
    let table = &mut tm().task_mut(curr).file_table;
    let fd = table.iter().position(|slot| slot.is_none());
    if let Some(fd) = fd {
        table[fd] = Some(file_id);
    }
    irq::leave_protection(state);
    fd.map(|fd| fd as i32)
}

pub(crate) fn task_remove_fd(fd: i32) {
    if fd < 0 || fd as usize >= TASK_OFILE_NR {
        return;
    }
    if let Some(curr) = task_current() {
        let state = irq::enter_protection();
        tm().task_mut(curr).file_table[fd as usize] = None;
        irq::leave_protection(state);
    }
}

// fork -----------------------------------------------------------------------

/// Take a free arena slot, reserving it against concurrent forks.
fn alloc_task() -> Option<TaskId> {
    TABLE_MUTEX.lock();
    let manager = tm();
    let mut found = None;
    for i in DYN_BASE..TASK_NR {
        if manager.tasks[i].pid == 0 {
            manager.tasks[i].pid = u32::MAX; // reserved until task_init
            found = Some(TaskId(i));
            break;
        }
    }
    TABLE_MUTEX.unlock();
    found
}

fn free_task(id: TaskId) {
    TABLE_MUTEX.lock();
    tm().task_mut(id).pid = 0;
    TABLE_MUTEX.unlock();
}

fn copy_opened_files(child: TaskId) {
    let manager = tm();
    let parent = manager.curr.expect("fork without a current task");

    for i in 0..TASK_OFILE_NR {
        if let Some(file_id) = manager.task(parent).file_table[i] {
            file::file_inc_ref(file_id);
            manager.task_mut(child).file_table[i] = Some(file_id);
        }
    }
}

/// Duplicate the current task. The child resumes at the parent's trap point
/// with eax forced to 0 and a private copy of the user address space.
pub(crate) fn sys_fork() -> i32 {
    let manager = tm();
    let parent_id = manager.curr.expect("fork without a current task");

    let child_id = match alloc_task() {
        Some(id) => id,
        None => {
            println!("no free task slot");
            return -1;
        }
    };

    // The register snapshot at the trap point sits at the top of the
    // parent's kernel stack.
    let frame = unsafe {
        &*((manager.task(parent_id).tss.esp0 - core::mem::size_of::<SyscallFrame>() as u32)
            as *const SyscallFrame)
    };

    let parent_name = manager.task(parent_id).name;
    if task_init(
        child_id,
        util::name_bytes(&parent_name),
        0,
        frame.eip,
        frame.esp + 4 * SYSCALL_PARAM_COUNT,
    )
    .is_err()
    {
        free_task(child_id);
        return -1;
    }

    copy_opened_files(child_id);

    let (parent_heap_start, parent_heap_end) = {
        let parent = manager.task(parent_id);
        (parent.heap_start, parent.heap_end)
    };
    {
        let child = manager.task_mut(child_id);
        child.tss.eax = 0;
        child.tss.ebx = frame.ebx;
        child.tss.ecx = frame.ecx;
        child.tss.edx = frame.edx;
        child.tss.esi = frame.esi;
        child.tss.edi = frame.edi;
        child.tss.ebp = frame.ebp;

        child.tss.cs = frame.cs;
        child.tss.ds = frame.ds;
        child.tss.es = frame.es;
        child.tss.fs = frame.fs;
        child.tss.gs = frame.gs;
        child.tss.eflags = frame.eflags;

        child.parent = Some(parent_id);
        child.heap_start = parent_heap_start;
        child.heap_end = parent_heap_end;
    }

    // Swap the empty address space made by task_init for a deep copy of the
    // parent's.
    let copied = manager.task(parent_id).page_dir().copy_uvm();
    match copied {
        Some(dir) => {
            let child = manager.task_mut(child_id);
            child.page_dir().destroy_uvm();
            child.tss.cr3 = dir.0 .0;
        }
        None => {
            task_uninit(child_id);
            free_task(child_id);
            return -1;
        }
    }

    task_start(child_id);
    manager.task(child_id).pid as i32
}

// execve ----------------------------------------------------------------------

fn get_file_name(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&c| c == b'/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

fn load_phdr(fd: i32, phdr: &Elf32Phdr, page_dir: PageDir) -> Result<(), ()> {
    if page_dir
        .alloc_for_page_dir(phdr.p_vaddr, phdr.p_memsz, PteFlags::P | PteFlags::U | PteFlags::W)
        .is_err()
    {
        println!("no memory for segment");
        return Err(());
    }

    if fs::sys_lseek(fd, phdr.p_offset, 0) < 0 {
        println!("seek to segment failed");
        return Err(());
    }

    // Copy through the physical window page by page; the new address space
    // is not the live one yet.
    let mut vaddr = phdr.p_vaddr;
    let mut size = phdr.p_filesz;
    while size > 0 {
        let in_page = PGSIZE - (vaddr & (PGSIZE - 1));
        let chunk = core::cmp::min(size, in_page);
        let paddr = match page_dir.get_paddr(vaddr) {
            Some(pa) => pa,
            None => return Err(()),
        };
        if fs::sys_read(fd, paddr.as_mut_ptr::<u8>(), chunk as i32) < chunk as i32 {
            println!("read segment failed");
            return Err(());
        }
        size -= chunk;
        vaddr += chunk;
    }

    Ok(())
}

/// Map an ELF image into `page_dir`; returns the entry point (0 on failure).
fn load_elf_file(id: TaskId, name: &[u8], page_dir: PageDir) -> u32 {
    let mut path = [0u8; FILE_NAME_SIZE + FS_MOUNT_SIZE];
    let n = core::cmp::min(name.len(), path.len() - 1);
    path[..n].copy_from_slice(&name[..n]);

    let fd = fs::sys_open(path.as_ptr(), file::O_RDONLY);
    if fd < 0 {
        println!("open elf failed");
        return 0;
    }

    let mut entry = 0;
    'load: {
        let mut elf_hdr = Elf32Ehdr::zeroed();
        let hdr_size = core::mem::size_of::<Elf32Ehdr>() as i32;
        if fs::sys_read(fd, &mut elf_hdr as *mut Elf32Ehdr as *mut u8, hdr_size) < hdr_size {
            println!("elf header too small");
            break 'load;
        }
        if !elf_hdr.is_valid() {
            println!("bad elf magic");
            break 'load;
        }

        let mut e_phoff = elf_hdr.e_phoff;
        for _ in 0..elf_hdr.e_phnum {
            if fs::sys_lseek(fd, e_phoff, 0) < 0 {
                println!("seek to phdr failed");
                break 'load;
            }

            let mut phdr = Elf32Phdr::zeroed();
            let phdr_size = core::mem::size_of::<Elf32Phdr>() as i32;
            if fs::sys_read(fd, &mut phdr as *mut Elf32Phdr as *mut u8, phdr_size) < phdr_size {
                println!("read phdr failed");
                break 'load;
            }
            e_phoff += elf_hdr.e_phentsize as u32;

            if phdr.p_type != PT_LOAD || phdr.p_vaddr < MEMORY_TASK_BASE {
                continue;
            }

            if load_phdr(fd, &phdr, page_dir).is_err() {
                println!("load segment failed");
                break 'load;
            }

            let task = tm().task_mut(id);
            task.heap_start = phdr.p_vaddr + phdr.p_memsz;
            task.heap_end = task.heap_start;
        }

        entry = elf_hdr.e_entry;
    }

    fs::sys_close(fd);
    entry
}

fn string_count(argv: *const *const u8) -> usize {
    if argv.is_null() {
        return 0;
    }
    let mut count = 0;
    unsafe {
        while !(*argv.add(count)).is_null() {
            count += 1;
        }
    }
    count
}

#[repr(C)]
struct TaskArgs {
    argc: u32,
    argv: u32, // user-space pointer to the argv array
}

/// Marshal argv into the new address space at `to`: a TaskArgs header, the
/// pointer array, then the packed strings.
fn copy_args(to: u32, page_dir: PageDir, argc: usize, argv: *const *const u8) -> Result<(), ()> {
    let args = TaskArgs {
        argc: argc as u32,
        argv: to + core::mem::size_of::<TaskArgs>() as u32,
    };

    let mut dest_arg = to + core::mem::size_of::<TaskArgs>() as u32 + 4 * argc as u32;
    let argv_table = page_dir
        .get_paddr(to + core::mem::size_of::<TaskArgs>() as u32)
        .ok_or(())?
        .as_mut_ptr::<u32>();

    for i in 0..argc {
        let from = unsafe { *argv.add(i) };
        let len = unsafe { util::strnlen(from, MEM_TASK_ARG_SIZE as usize) } + 1;
        page_dir.copy_uvm_data(dest_arg, from, len)?;
        unsafe {
            *argv_table.add(i) = dest_arg;
        }
        dest_arg += len as u32;
    }

    page_dir.copy_uvm_data(to, &args as *const TaskArgs as *const u8, core::mem::size_of::<TaskArgs>())
}

/// Replace the current image. On success the rewritten syscall frame makes
/// the trampoline's far return land on the new entry point; on failure the
/// caller's address space is untouched.
pub(crate) fn sys_execve(name: *const u8, argv: *const *const u8, _env: *const *const u8) -> i32 {
    let manager = tm();
    let id = manager.curr.expect("execve without a current task");

    let name = unsafe { util::cstr_bytes(name, FILE_NAME_SIZE + FS_MOUNT_SIZE) };
    {
        let base = get_file_name(name);
        let task = manager.task_mut(id);
        util::copy_name(&mut task.name, base);
    }

    let old_page_dir = manager.task(id).page_dir();
    let new_page_dir = match PageDir::create_uvm() {
        Some(dir) => dir,
        None => return -1,
    };

    let ok = 'build: {
        let entry = load_elf_file(id, name, new_page_dir);
        if entry == 0 {
            break 'build false;
        }

        let stack_top = MEM_TASK_STACK_TOP - MEM_TASK_ARG_SIZE;
        if new_page_dir
            .alloc_for_page_dir(
                MEM_TASK_STACK_TOP - MEM_TASK_STACK_SIZE,
                MEM_TASK_STACK_SIZE,
                PteFlags::P | PteFlags::U | PteFlags::W,
            )
            .is_err()
        {
            break 'build false;
        }

        let argc = string_count(argv);
        if copy_args(stack_top, new_page_dir, argc, argv).is_err() {
            break 'build false;
        }

        // Rewrite the trap frame so the return from this syscall enters the
        // fresh image.
        let frame = unsafe {
            &mut *((manager.task(id).tss.esp0 - core::mem::size_of::<SyscallFrame>() as u32)
                as *mut SyscallFrame)
        };
        frame.eip = entry;
        frame.eax = 0;
        frame.ebx = 0;
        frame.edx = 0;
        frame.esi = 0;
        frame.edi = 0;
        frame.ebp = 0;
        frame.eflags = EFLAGS_DEFAULT | EFLAGS_IF;
        frame.esp = stack_top - 4 * SYSCALL_PARAM_COUNT;

        true
    };

    if !ok {
        new_page_dir.destroy_uvm();
        return -1;
    }

    manager.task_mut(id).tss.cr3 = new_page_dir.0 .0;
    pmap::mmu_set_page_dir(new_page_dir);
    old_page_dir.destroy_uvm();
    0
}

// wait / exit -------------------------------------------------------------------

/// Reap a zombie child, blocking until one exits.
pub(crate) fn sys_wait(status: *mut i32) -> i32 {
    let manager = tm();
    let curr = manager.curr.expect("wait without a current task");

    loop {
        TABLE_MUTEX.lock();

        for i in DYN_BASE..TASK_NR {
            let id = TaskId(i);
            let task = manager.task(id);
            if task.pid == 0 || task.parent != Some(curr) {
                continue;
            }

            if task.state == TaskState::Zombie {
                let pid = task.pid as i32;
                unsafe {
                    *status = task.status;
                }
                task_uninit(id);
                TABLE_MUTEX.unlock();
                return pid;
            }
        }

        let state = irq::enter_protection();
        manager.set_block(curr);
        manager.task_mut(curr).state = TaskState::Waiting;
        irq::leave_protection(state);

        TABLE_MUTEX.unlock();
        task_dispatch();
    }
}

/// Terminate the current task: release its descriptors, hand its children
/// to the first task, wake whoever waits for it, become a zombie.
pub(crate) fn sys_exit(exit_status: i32) -> ! {
    let manager = tm();
    let curr = manager.curr.expect("exit without a current task");

    fs::close_task_files();

    let mut moved_zombie = false;
    TABLE_MUTEX.lock();
    for i in DYN_BASE..TASK_NR {
        let task = manager.task_mut(TaskId(i));
        if task.pid != 0 && task.parent == Some(curr) {
            task.parent = Some(FIRST);
            if task.state == TaskState::Zombie {
                moved_zombie = true;
            }
        }
    }
    TABLE_MUTEX.unlock();

    let state = irq::enter_protection();

    let parent = manager.task(curr).parent;
    // Orphaned zombies were just handed to the first task; make sure it
    // gets to reap them.
    if moved_zombie && parent != Some(FIRST) && manager.task(FIRST).state == TaskState::Waiting {
        manager.set_ready(FIRST);
    }
    if let Some(parent) = parent {
        if manager.task(parent).state == TaskState::Waiting {
            manager.set_ready(parent);
        }
    }

    let task = manager.task_mut(curr);
    task.status = exit_status;
    task.state = TaskState::Zombie;
    manager.set_block(curr);

    irq::leave_protection(state);

    task_dispatch();
    panic!("zombie task resumed");
}

// sbrk -----------------------------------------------------------------------

/// Grow the heap by `incr` bytes; returns the new break.
pub(crate) fn sys_sbrk(incr: i32) -> u32 {
    let manager = tm();
    let curr = manager.curr.expect("sbrk without a current task");
    let task = manager.task_mut(curr);

    if incr < 0 {
        println!("sbrk shrink not supported");
        return task.heap_end;
    }
    if incr == 0 {
        return task.heap_end;
    }
    let incr = incr as u32;

    let end = task.heap_end + incr;
    let mut alloc_start = task.heap_end;
    let mut alloc_size = incr;

    // The tail of the last mapped page absorbs what it can.
    let start_offset = alloc_start % PGSIZE;
    if start_offset != 0 {
        if start_offset + incr <= PGSIZE {
            task.heap_end = end;
            return end;
        }
        let in_page = PGSIZE - start_offset;
        alloc_start += in_page;
        alloc_size -= in_page;
    }

    if alloc_size > 0 {
        let dir = task.page_dir();
        if dir
            .alloc_for_page_dir(alloc_start, alloc_size, PteFlags::P | PteFlags::U | PteFlags::W)
            .is_err()
        {
            println!("sbrk: out of memory");
            return 0;
        }
    }

    let task = manager.task_mut(curr);
    task.heap_end = end;
    end
}

// Boot ------------------------------------------------------------------------

/// Create the shared ring-3 segments and the idle task.
pub(crate) fn task_manager_init() {
    let manager = tm();

    let data_sel = gdt::gdt_alloc_desc().expect("gdt full");
    gdt::segment_desc_set(
        data_sel,
        0x0,
        0xffff_ffff,
        SEG_P_PRESENT | SEG_DPL3 | SEG_S_NORMAL | SEG_TYPE_DATA | SEG_TYPE_RW | SEG_D,
    );
    manager.app_data_sel = data_sel;

    let code_sel = gdt::gdt_alloc_desc().expect("gdt full");
    gdt::segment_desc_set(
        code_sel,
        0x0,
        0xffff_ffff,
        SEG_P_PRESENT | SEG_DPL3 | SEG_S_NORMAL | SEG_TYPE_CODE | SEG_TYPE_RW | SEG_D,
    );
    manager.app_code_sel = code_sel;

    let idle_esp = (IDLE_STACK.0.get() as *const u32 as u32) + 4 * IDLE_STACK_SIZE as u32;
    task_init(
        IDLE,
        b"idle task",
        TASK_FLAGS_SYSTEM,
        idle_task_entry as usize as u32,
        idle_esp,
    )
    .expect("idle task init failed");
    task_start(IDLE);
}

/// Set up the first user task from the kernel-linked init image and switch
/// the CPU onto its TSS and address space. It starts running once
/// move_to_first_task drops to ring 3.
pub(crate) fn task_first_init() {
    #[cfg(target_arch = "x86")]
    {
        extern "C" {
            static s_first_task: u8;
            static e_first_task: u8;
            fn first_task_entry();
        }

        let first_start = first_task_entry as usize as u32;
        let copy_size =
            unsafe { (&e_first_task as *const u8 as u32) - (&s_first_task as *const u8 as u32) };
        let alloc_size = 10 * PGSIZE;
        assert!(copy_size < alloc_size, "first task image too large");

        task_init(FIRST, b"first task", 0, first_start, first_start + alloc_size)
            .expect("first task init failed");

        let manager = tm();
        {
            let heap = unsafe { &e_first_task as *const u8 as u32 };
            let task = manager.task_mut(FIRST);
            task.heap_start = heap;
            task.heap_end = heap;
        }

        x86::ltr(manager.task(FIRST).tss_sel);
        manager.curr = Some(FIRST);

        let dir = manager.task(FIRST).page_dir();
        pmap::mmu_set_page_dir(dir);

        dir.alloc_for_page_dir(first_start, alloc_size, PteFlags::P | PteFlags::U | PteFlags::W)
            .expect("first task mapping failed");
        unsafe {
            core::ptr::copy_nonoverlapping(
                &s_first_task as *const u8,
                first_start as *mut u8,
                copy_size as usize,
            );
        }

        task_start(FIRST);
    }
}

/// Drop into ring 3 at the first task's entry. Boot ends here.
#[allow(unreachable_code)]
pub(crate) fn move_to_first_task() -> ! {
    #[cfg(target_arch = "x86")]
    {
        let manager = tm();
        let curr = manager.curr.expect("no first task");
        let tss = &manager.task(curr).tss;
        unsafe {
            core::arch::asm!(
                "pushl {ss}",
                "pushl {esp}",
                "pushl {eflags}",
                "pushl {cs}",
                "pushl {eip}",
                "movw {ss:x}, %ds",
                "movw {ss:x}, %es",
                "movw {ss:x}, %fs",
                "movw {ss:x}, %gs",
                "iretl",
                ss = in(reg) tss.ss,
                esp = in(reg) tss.esp,
                eflags = in(reg) tss.eflags,
                cs = in(reg) tss.cs,
                eip = in(reg) tss.eip,
                options(att_syntax, noreturn)
            );
        }
    }
    loop {
        x86::hlt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_fifo() {
        let mut q = TaskQueue::new();
        q.push(TaskId(3));
        q.push(TaskId(5));
        q.push(TaskId(7));
        assert_eq!(q.pop(), Some(TaskId(3)));
        assert_eq!(q.pop(), Some(TaskId(5)));
        assert_eq!(q.pop(), Some(TaskId(7)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn queue_removal_keeps_order() {
        let mut q = TaskQueue::new();
        for i in 1..=4 {
            q.push(TaskId(i));
        }
        assert!(q.remove(TaskId(2)));
        assert!(!q.remove(TaskId(9)));
        assert_eq!(q.pop(), Some(TaskId(1)));
        assert_eq!(q.pop(), Some(TaskId(3)));
        assert_eq!(q.pop(), Some(TaskId(4)));
    }

    #[test]
    fn rotation_moves_head_to_tail() {
        let mut q = TaskQueue::new();
        q.push(TaskId(1));
        q.push(TaskId(2));

        let head = q.pop().unwrap();
        q.push(head);
        assert_eq!(q.front(), Some(TaskId(2)));
        assert_eq!(q.get(1), TaskId(1));
    }

    fn fake_task_manager() -> Box<TaskManager> {
        let mut m = Box::new(TaskManager::new());
        // Three runnable tasks plus idle; bypass tss_init (no hardware).
        for i in 1..=3 {
            m.tasks[i].pid = i as u32;
            m.tasks[i].time_ticks = TASK_TIME_SLICE_DEFAULT;
            m.tasks[i].slice_ticks = TASK_TIME_SLICE_DEFAULT;
            m.set_ready(TaskId(i));
        }
        m.curr = Some(TaskId(1));
        m.tasks[1].state = TaskState::Running;
        m
    }

    #[test]
    fn ready_list_is_fifo_and_idle_never_queues() {
        let mut m = fake_task_manager();
        assert_eq!(m.next_run(), TaskId(1));

        m.set_ready(IDLE);
        assert_eq!(m.ready.len(), 3, "idle is excluded from the ready list");

        m.ready = TaskQueue::new();
        assert_eq!(m.next_run(), IDLE, "idle runs when nothing is ready");
    }

    #[test]
    fn slice_expiry_rotates_round_robin() {
        let mut m = fake_task_manager();

        for _ in 0..TASK_TIME_SLICE_DEFAULT - 1 {
            m.tick_bookkeeping();
            assert_eq!(m.next_run(), TaskId(1));
        }
        m.tick_bookkeeping(); // slice hits zero
        assert_eq!(m.next_run(), TaskId(2));
        assert_eq!(m.ready.get(2), TaskId(1), "preempted task went to the tail");
        assert_eq!(
            m.tasks[1].slice_ticks,
            TASK_TIME_SLICE_DEFAULT,
            "slice reloaded"
        );
    }

    #[test]
    fn sleepers_wake_after_their_ticks() {
        let mut m = fake_task_manager();

        // Task 3 sleeps for 2 ticks.
        m.set_block(TaskId(3));
        m.set_sleep(TaskId(3), 2);
        assert_eq!(m.tasks[3].state, TaskState::Sleeping);
        assert_eq!(m.ready.len(), 2);

        m.tick_bookkeeping();
        assert_eq!(m.tasks[3].state, TaskState::Sleeping);
        m.tick_bookkeeping();
        assert_eq!(m.tasks[3].state, TaskState::Ready);
        assert!(m.ready.contains(TaskId(3)));
        assert_eq!(m.sleeping.len(), 0);
    }

    #[test]
    fn msleep_rounds_up_to_whole_ticks() {
        // The rounding rule itself; sys_msleep needs live tasking.
        let round = |ms: u32| (core::cmp::max(ms, OS_TICK_MS) + OS_TICK_MS - 1) / OS_TICK_MS;
        assert_eq!(round(1), 1);
        assert_eq!(round(OS_TICK_MS), 1);
        assert_eq!(round(OS_TICK_MS + 1), 2);
        assert_eq!(round(35), 4);
    }

    #[test]
    fn basename_extraction() {
        assert_eq!(get_file_name(b"/home/shell.elf"), b"shell.elf");
        assert_eq!(get_file_name(b"shell.elf"), b"shell.elf");
        assert_eq!(get_file_name(b"a/b/c"), b"c");
    }
}
