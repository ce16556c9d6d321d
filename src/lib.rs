#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod allocator;
pub mod cpu;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod io;
pub mod loader;
pub mod memory;
pub mod process;
pub mod syscalls;
pub mod thread;
pub mod trap;
pub mod uart;

// Boot shim: OpenSBI drops us here in S-mode; all we need before Rust is
// a stack.
#[cfg(target_arch = "riscv64")]
core::arch::global_asm!(
    r#"
    .section .text
    .globl _start
_start:
    la      sp, _boot_stack_top
    call    kmain
1:  wfi
    j       1b

    .section .bss
    .align 4
_boot_stack:
    .space 65536
_boot_stack_top:
"#
);

#[no_mangle]
pub extern "C" fn kmain() -> ! {
    uart::init();
    log_info!("IonOS kernel started.");

    memory::init();
    trap::init();
    thread::init();
    drivers::init();
    syscalls::init();

    thread::spawn("init", init_main, 0).expect("spawning init");
    println!("IonOS is up; handing off to init.");

    cpu::interrupts_enable();

    // Reap children until none remain, then park for good.
    loop {
        match thread::join_any_checked() {
            Ok(tid) => log_info!("reaped thread {}", tid),
            Err(_) => break,
        }
    }
    log_info!("No runnable children left; kernel main retiring.");
    thread::exit_current()
}

/// First spawned thread: mount the boot image, give itself a process with
/// the init program at descriptor 0 and the console at descriptor 1, and
/// exec into user mode.
fn init_main(_arg: usize) {
    if let Err(e) = start_init() {
        log_error!("init failed: {}", e);
    }
}

fn start_init() -> error::Result<()> {
    let disk = drivers::open("blk", 0)?;
    fs::init(disk)?;

    process::adopt_current_thread()?;
    let program = fs::open("init")?;
    let console = drivers::open("cons", 0)?;
    process::io_install(0, program.clone())?;
    process::io_install(1, console)?;

    // Returns only on failure.
    process::exec(program)?;
    Ok(())
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log_error!("{}", info);
    loop {
        cpu::wait_for_interrupt();
    }
}
