//! CPU register context saved/restored during context switches: the
//! RISC-V callee-saved set (`s0..s11`), the return address, the stack
//! pointer, and `tp`, which always carries the running thread's pointer.

/// Saved switch-time state. Offsets are baked into the assembly below.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub tp: usize,
    pub s: [usize; 12],
}

impl Context {
    /// Create an empty context (used for the boot thread; its slots are
    /// filled on the first switch away from it).
    pub const fn empty() -> Self {
        Context {
            ra: 0,
            sp: 0,
            tp: 0,
            s: [0; 12],
        }
    }

    /// Context for a fresh kernel thread: first scheduled execution enters
    /// the start shim, which calls `entry(arg)` out of `s0`/`s1`.
    pub fn first_run(entry: usize, arg: usize, sp: usize, thread_ptr: usize) -> Self {
        let mut s = [0; 12];
        s[0] = entry;
        s[1] = arg;
        Context {
            ra: thread_start as usize,
            sp,
            tp: thread_ptr,
            s,
        }
    }

    /// Context for a fork child: first scheduled execution restores the
    /// cloned trap frame at `trap_frame` and returns to user mode.
    pub fn forked(trap_frame: usize, thread_ptr: usize) -> Self {
        Context {
            ra: fork_child_start as usize,
            sp: trap_frame,
            tp: thread_ptr,
            s: [0; 12],
        }
    }
}

/// Switch from `old` to `new`: save the callee-saved registers and stack
/// pointer into `old`, load `new`'s, and continue at `new.ra`. `tp`
/// travels with the context so the current thread stays reachable.
///
/// # Safety
/// Both pointers must reference valid contexts whose stacks are live.
#[cfg(target_arch = "riscv64")]
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old: *mut Context, new: *const Context) {
    core::arch::naked_asm!(
        "sd ra, 0(a0)",
        "sd sp, 8(a0)",
        "sd tp, 16(a0)",
        "sd s0, 24(a0)",
        "sd s1, 32(a0)",
        "sd s2, 40(a0)",
        "sd s3, 48(a0)",
        "sd s4, 56(a0)",
        "sd s5, 64(a0)",
        "sd s6, 72(a0)",
        "sd s7, 80(a0)",
        "sd s8, 88(a0)",
        "sd s9, 96(a0)",
        "sd s10, 104(a0)",
        "sd s11, 112(a0)",
        "ld ra, 0(a1)",
        "ld sp, 8(a1)",
        "ld tp, 16(a1)",
        "ld s0, 24(a1)",
        "ld s1, 32(a1)",
        "ld s2, 40(a1)",
        "ld s3, 48(a1)",
        "ld s4, 56(a1)",
        "ld s5, 64(a1)",
        "ld s6, 72(a1)",
        "ld s7, 80(a1)",
        "ld s8, 88(a1)",
        "ld s9, 96(a1)",
        "ld s10, 104(a1)",
        "ld s11, 112(a1)",
        "ret",
    );
}

#[cfg(not(target_arch = "riscv64"))]
pub unsafe extern "C" fn switch_context(_old: *mut Context, _new: *const Context) {
    unreachable!("context switch on host");
}

/// First instructions of every spawned kernel thread: run the scheduler's
/// post-switch bookkeeping, enable interrupts, call `entry(arg)`, and exit
/// when it returns.
#[cfg(target_arch = "riscv64")]
#[unsafe(naked)]
extern "C" fn thread_start() {
    core::arch::naked_asm!(
        "call {prologue}",
        "mv a0, s1",
        "jalr s0",
        "call {finish}",
        prologue = sym super::thread_entry_prologue,
        finish = sym super::thread_entry_finish,
    );
}

#[cfg(not(target_arch = "riscv64"))]
extern "C" fn thread_start() {
    unreachable!("thread start shim on host");
}

/// First instructions of a fork child: `sp` points at the cloned trap
/// frame (its `a0` slot already zeroed), which the trap-exit path restores
/// wholesale before `sret`.
#[cfg(target_arch = "riscv64")]
#[unsafe(naked)]
extern "C" fn fork_child_start() {
    core::arch::naked_asm!(
        "call {prologue}",
        "mv a0, sp",
        "j _trap_user_exit",
        prologue = sym super::fork_entry_prologue,
    );
}

#[cfg(not(target_arch = "riscv64"))]
extern "C" fn fork_child_start() {
    unreachable!("fork trampoline on host");
}
