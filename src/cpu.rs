//! Thin wrappers over the S-mode CSR surface. Everything architecture
//! specific that is not raw trap/switch assembly funnels through here, so
//! the rest of the kernel stays host-compilable for unit tests.

#[cfg(target_arch = "riscv64")]
mod rv64 {
    use riscv::register::{satp, scause, sie, sstatus, stval, stvec, time};

    /// Run `f` with supervisor interrupts masked, restoring the previous
    /// state afterwards. All scheduler-critical sections go through this.
    pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
        let was_enabled = sstatus::read().sie();
        if was_enabled {
            unsafe { sstatus::clear_sie() };
        }
        let ret = f();
        if was_enabled {
            unsafe { sstatus::set_sie() };
        }
        ret
    }

    pub fn interrupts_enable() {
        unsafe { sstatus::set_sie() };
    }

    pub fn interrupts_disable() {
        unsafe { sstatus::clear_sie() };
    }

    /// Permit S-mode loads/stores through U=1 mappings. Syscalls rely on
    /// this to copy through validated user pointers in place.
    pub fn allow_user_memory_access() {
        unsafe { sstatus::set_sum() };
    }

    pub fn wait_for_interrupt() {
        unsafe { core::arch::asm!("wfi") };
    }

    /// Install the Sv39 root table whose physical address is `root_pa` and
    /// fence the translation caches.
    pub fn translation_set_root(root_pa: usize) {
        unsafe {
            satp::set(satp::Mode::Sv39, 0, root_pa >> 12);
            core::arch::asm!("sfence.vma");
        }
    }

    /// Fence the translation caches after an in-place change to the
    /// active address space (demand mapping).
    pub fn translation_fence() {
        unsafe { core::arch::asm!("sfence.vma") };
    }

    pub fn trap_vector_set(addr: usize) {
        unsafe { stvec::write(addr, stvec::TrapMode::Direct) };
    }

    pub fn trap_cause() -> scause::Scause {
        scause::read()
    }

    pub fn trap_value() -> usize {
        stval::read()
    }

    pub fn timer_interrupts_enable() {
        unsafe { sie::set_stimer() };
    }

    /// Program the next timer interrupt `delta` ticks from now.
    pub fn timer_arm(delta: u64) {
        let now = time::read() as u64;
        let _ = sbi_rt::set_timer(now.wrapping_add(delta));
    }

    /// The `sstatus` image for a trap frame that enters user mode: SPP
    /// clear (return to U), SPIE set (interrupts on after `sret`), SUM
    /// set (kernel keeps access to validated user buffers).
    pub fn user_sstatus() -> usize {
        const SPIE: usize = 1 << 5;
        const SPP: usize = 1 << 8;
        const SUM: usize = 1 << 18;
        let current: usize;
        unsafe { core::arch::asm!("csrr {}, sstatus", out(reg) current) };
        (current & !SPP) | SPIE | SUM
    }
}

#[cfg(target_arch = "riscv64")]
pub use rv64::*;

// Host stand-ins so pure-logic modules unit-test off target. None of the
// scheduler paths that reach these run under `cargo test`.
#[cfg(not(target_arch = "riscv64"))]
mod host {
    pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
        f()
    }

    pub fn interrupts_enable() {}

    pub fn interrupts_disable() {}

    pub fn allow_user_memory_access() {}

    pub fn wait_for_interrupt() {}

    pub fn translation_set_root(_root_pa: usize) {}

    pub fn translation_fence() {}

    pub fn trap_vector_set(_addr: usize) {}

    pub fn timer_interrupts_enable() {}

    pub fn timer_arm(_delta: u64) {}

    pub fn user_sstatus() -> usize {
        0
    }
}

#[cfg(not(target_arch = "riscv64"))]
pub use host::*;
