pub mod frame;

pub use frame::{StackAnchor, TrapFrame, STACK_ANCHOR_SIZE, TRAP_FRAME_SIZE};

#[cfg(target_arch = "riscv64")]
mod entry;

#[cfg(target_arch = "riscv64")]
extern "C" {
    /// Restore a prepared trap frame and `sret` to user mode. Also the
    /// first-entry path for `exec` and the fork-child trampoline.
    pub fn _trap_user_exit(tfr: *mut TrapFrame) -> !;
    fn _trap_kernel_entry();
}

/// Timer tick period, in timebase units (10 MHz on QEMU virt: 10 ms).
pub const TIMER_INTERVAL: u64 = 100_000;

#[cfg(target_arch = "riscv64")]
pub fn init() {
    crate::cpu::trap_vector_set(_trap_kernel_entry as usize);
    crate::cpu::timer_interrupts_enable();
    crate::cpu::timer_arm(TIMER_INTERVAL);
    crate::log_info!("Trap vectors installed, preemption timer armed.");
}

#[cfg(not(target_arch = "riscv64"))]
pub fn init() {}

#[cfg(target_arch = "riscv64")]
#[no_mangle]
extern "C" fn trap_user_dispatch(tfr: *mut TrapFrame) -> *mut TrapFrame {
    use riscv::register::scause::{Exception, Interrupt, Trap};

    let frame = unsafe { &mut *tfr };
    match crate::cpu::trap_cause().cause() {
        Trap::Exception(Exception::UserEnvCall) => {
            // Resume past the ecall; the fork child inherits the advanced
            // sepc through the cloned frame.
            frame.sepc += 4;
            crate::syscalls::dispatch(frame);
        }
        Trap::Interrupt(Interrupt::SupervisorTimer) => {
            crate::cpu::timer_arm(TIMER_INTERVAL);
            crate::thread::yield_now();
        }
        Trap::Exception(Exception::LoadPageFault)
        | Trap::Exception(Exception::StorePageFault)
        | Trap::Exception(Exception::InstructionPageFault) => {
            let va = crate::cpu::trap_value();
            if crate::process::handle_page_fault(va) {
                crate::cpu::translation_fence();
            } else {
                crate::log_error!(
                    "user page fault at {:#x} (sepc={:#x}), terminating process",
                    va,
                    frame.sepc
                );
                crate::process::exit_current();
            }
        }
        cause => {
            crate::log_error!(
                "unexpected user trap {:?} (stval={:#x} sepc={:#x}), terminating process",
                cause,
                crate::cpu::trap_value(),
                frame.sepc
            );
            crate::process::exit_current();
        }
    }
    tfr
}

#[cfg(target_arch = "riscv64")]
#[no_mangle]
extern "C" fn trap_kernel_dispatch(tfr: *mut TrapFrame) {
    use riscv::register::scause::{Interrupt, Trap};

    let frame = unsafe { &mut *tfr };
    match crate::cpu::trap_cause().cause() {
        Trap::Interrupt(Interrupt::SupervisorTimer) => {
            crate::cpu::timer_arm(TIMER_INTERVAL);
            // Preemption point at the end of trap handling. The `try`
            // variant backs off if the interrupted code owns the thread
            // table.
            crate::thread::try_yield_now();
        }
        cause => {
            panic!(
                "kernel trap {:?} (stval={:#x} sepc={:#x})",
                cause,
                crate::cpu::trap_value(),
                frame.sepc
            );
        }
    }
}
