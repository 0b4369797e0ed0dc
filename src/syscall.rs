// The ring-3 → ring-0 system call gate.
//
// User code pushes five 32-bit words (id, arg0..arg3) and far-calls through
// SELECTOR_SYSCALL. The call gate copies the five words to the kernel stack;
// the trampoline below materialises a SyscallFrame around them and calls the
// dispatcher. The return value travels back in the frame's eax slot, and
// `retf $20` releases the copied words from both stacks.

use crate::constants::*;
use crate::util;
use crate::{console, fs, task};

/// Register snapshot on the kernel stack during a system call, lowest
/// address first. fork() reads this to seed the child and execve() rewrites
/// eip/esp/eflags before returning.
#[allow(dead_code)] // some slots exist only for the trampoline's layout
#[repr(C)]
pub(crate) struct SyscallFrame {
    pub(crate) eflags: u32,
    pub(crate) gs: u32,
    pub(crate) fs: u32,
    pub(crate) es: u32,
    pub(crate) ds: u32,
    pub(crate) edi: u32,
    pub(crate) esi: u32,
    pub(crate) ebp: u32,
    pub(crate) esp_dummy: u32,
    pub(crate) ebx: u32,
    pub(crate) edx: u32,
    pub(crate) ecx: u32,
    pub(crate) eax: u32,
    pub(crate) eip: u32,
    pub(crate) cs: u32,
    pub(crate) func_id: u32,
    pub(crate) arg0: u32,
    pub(crate) arg1: u32,
    pub(crate) arg2: u32,
    pub(crate) arg3: u32,
    pub(crate) esp: u32,
    pub(crate) ss: u32,
}

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    r#"
    .text
    .globl exception_handler_syscall
    exception_handler_syscall:
        pushal
        pushl %ds
        pushl %es
        pushl %fs
        pushl %gs
        pushfl
        movw $0x10, %ax
        movw %ax, %ds
        movw %ax, %es
        pushl %esp
        call do_handler_syscall
        addl $4, %esp
        popfl
        popl %gs
        popl %fs
        popl %es
        popl %ds
        popal
        lret $20
    "#,
    options(att_syntax)
);

/// Entry point address handed to the call-gate descriptor.
#[cfg(target_arch = "x86")]
pub(crate) fn gate_entry() -> u32 {
    extern "C" {
        fn exception_handler_syscall();
    }
    exception_handler_syscall as usize as u32
}

#[cfg(not(target_arch = "x86"))]
pub(crate) fn gate_entry() -> u32 {
    0
}

/// The stable syscall id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum SyscallId {
    Sleep = 0,
    GetPid = 1,
    PrintMsg = 2,
    Fork = 3,
    Execve = 4,
    Yield = 5,
    Open = 6,
    Read = 7,
    Write = 8,
    Close = 9,
    Lseek = 10,
    IsaTty = 11,
    Fstat = 12,
    Sbrk = 13,
    Dup = 14,
    Exit = 15,
    Wait = 16,
    OpenDir = 17,
    ReadDir = 18,
    CloseDir = 19,
    Ioctl = 20,
    Unlink = 21,
}

impl SyscallId {
    pub(crate) fn from_u32(id: u32) -> Option<SyscallId> {
        use SyscallId::*;
        match id {
            0 => Some(Sleep),
            1 => Some(GetPid),
            2 => Some(PrintMsg),
            3 => Some(Fork),
            4 => Some(Execve),
            5 => Some(Yield),
            6 => Some(Open),
            7 => Some(Read),
            8 => Some(Write),
            9 => Some(Close),
            10 => Some(Lseek),
            11 => Some(IsaTty),
            12 => Some(Fstat),
            13 => Some(Sbrk),
            14 => Some(Dup),
            15 => Some(Exit),
            16 => Some(Wait),
            17 => Some(OpenDir),
            18 => Some(ReadDir),
            19 => Some(CloseDir),
            20 => Some(Ioctl),
            21 => Some(Unlink),
            _ => None,
        }
    }
}

fn dispatch(id: SyscallId, frame: &mut SyscallFrame) -> i32 {
    let (a0, a1, a2, a3) = (frame.arg0, frame.arg1, frame.arg2, frame.arg3);
    match id {
        SyscallId::Sleep => {
            task::sys_msleep(a0);
            0
        }
        SyscallId::GetPid => task::sys_getpid(),
        SyscallId::PrintMsg => {
            let fmt = unsafe { util::cstr_bytes(a0 as *const u8, 256) };
            console::print_msg(fmt, a1);
            0
        }
        SyscallId::Fork => task::sys_fork(),
        SyscallId::Execve => {
            task::sys_execve(a0 as *const u8, a1 as *const *const u8, a2 as *const *const u8)
        }
        SyscallId::Yield => task::sys_sched_yield(),
        SyscallId::Open => fs::sys_open(a0 as *const u8, a1),
        SyscallId::Read => fs::sys_read(a0 as i32, a1 as *mut u8, a2 as i32),
        SyscallId::Write => fs::sys_write(a0 as i32, a1 as *const u8, a2 as i32),
        SyscallId::Close => fs::sys_close(a0 as i32),
        SyscallId::Lseek => fs::sys_lseek(a0 as i32, a1, a2 as i32),
        SyscallId::IsaTty => fs::sys_isatty(a0 as i32),
        SyscallId::Fstat => fs::sys_fstat(a0 as i32, a1 as *mut fs::Stat),
        SyscallId::Sbrk => task::sys_sbrk(a0 as i32) as i32,
        SyscallId::Dup => fs::sys_dup(a0 as i32),
        SyscallId::Exit => task::sys_exit(a0 as i32),
        SyscallId::Wait => task::sys_wait(a0 as *mut i32),
        SyscallId::OpenDir => fs::sys_opendir(a0 as *const u8, a1 as *mut fs::Dir),
        SyscallId::ReadDir => fs::sys_readdir(a0 as *mut fs::Dir, a1 as *mut fs::Dirent),
        SyscallId::CloseDir => fs::sys_closedir(a0 as *mut fs::Dir),
        SyscallId::Ioctl => fs::sys_ioctl(a0 as i32, a1 as i32, a2, a3),
        SyscallId::Unlink => fs::sys_unlink(a0 as *const u8),
    }
}

#[no_mangle]
extern "C" fn do_handler_syscall(frame: *mut SyscallFrame) {
    let frame = unsafe { &mut *frame };

    match SyscallId::from_u32(frame.func_id) {
        Some(id) => {
            let ret = dispatch(id, frame);
            frame.eax = ret as u32;
        }
        None => {
            println!("unknown syscall: {}", frame.func_id);
            frame.eax = -1i32 as u32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_ids_are_a_stable_abi() {
        // Numbers are part of the user contract; they must never shift.
        let expected = [
            (0, SyscallId::Sleep),
            (1, SyscallId::GetPid),
            (2, SyscallId::PrintMsg),
            (3, SyscallId::Fork),
            (4, SyscallId::Execve),
            (5, SyscallId::Yield),
            (6, SyscallId::Open),
            (7, SyscallId::Read),
            (8, SyscallId::Write),
            (9, SyscallId::Close),
            (10, SyscallId::Lseek),
            (11, SyscallId::IsaTty),
            (12, SyscallId::Fstat),
            (13, SyscallId::Sbrk),
            (14, SyscallId::Dup),
            (15, SyscallId::Exit),
            (16, SyscallId::Wait),
            (17, SyscallId::OpenDir),
            (18, SyscallId::ReadDir),
            (19, SyscallId::CloseDir),
            (20, SyscallId::Ioctl),
            (21, SyscallId::Unlink),
        ];
        for (num, id) in expected {
            assert_eq!(SyscallId::from_u32(num), Some(id));
            assert_eq!(id as u32, num);
        }
        assert_eq!(SyscallId::from_u32(22), None);
    }

    #[test]
    fn frame_layout_matches_the_trampoline() {
        use core::mem::{offset_of, size_of};
        // 13 saved registers + eip/cs + 5 words + esp/ss.
        assert_eq!(size_of::<SyscallFrame>(), 22 * 4);
        assert_eq!(offset_of!(SyscallFrame, eflags), 0);
        assert_eq!(offset_of!(SyscallFrame, edi), 5 * 4);
        assert_eq!(offset_of!(SyscallFrame, eax), 12 * 4);
        assert_eq!(offset_of!(SyscallFrame, eip), 13 * 4);
        assert_eq!(offset_of!(SyscallFrame, func_id), 15 * 4);
        assert_eq!(offset_of!(SyscallFrame, esp), 20 * 4);
    }
}
