//! Syscall dispatch. The environment-call trap lands here with the
//! caller's trap frame: number in `a7`, arguments in `a0..a2`, and the
//! result replacing `a0`. Every user pointer is validated against the
//! caller's address space before it is dereferenced.

use alloc::string::String;

use crate::error::{Error, Result};
use crate::io::{self, pipe::Pipe, Io, IOCTL_GETREFCNT};
use crate::memory::{memory_validate_vptr_len, memory_validate_vstr, PteFlags};
use crate::process;
use crate::trap::TrapFrame;
use crate::{drivers, fs};

pub const SYS_MSGOUT: usize = 0;
pub const SYS_EXIT: usize = 1;
pub const SYS_DEVOPEN: usize = 2;
pub const SYS_FSOPEN: usize = 3;
pub const SYS_CLOSE: usize = 4;
pub const SYS_READ: usize = 5;
pub const SYS_WRITE: usize = 6;
pub const SYS_IOCTL: usize = 7;
pub const SYS_EXEC: usize = 8;
pub const SYS_FORK: usize = 9;
pub const SYS_WAIT: usize = 10;
pub const SYS_PIPE: usize = 11;

/// Central dispatcher, called from the trap layer with `sepc` already
/// advanced past the `ecall`.
pub fn dispatch(tfr: &mut TrapFrame) {
    // Re-enable interrupts so long syscalls can be preempted at kernel
    // trap boundaries; trap entry masked them.
    crate::cpu::interrupts_enable();

    let number = tfr.a(7);
    let (a0, a1, a2) = (tfr.a(0), tfr.a(1), tfr.a(2));

    let ret: isize = match number {
        SYS_MSGOUT => result_to_ret(sys_msgout(a0)),
        SYS_EXIT => process::exit_current(),
        SYS_DEVOPEN => result_to_ret(sys_devopen(a0, a1, a2)),
        SYS_FSOPEN => result_to_ret(sys_fsopen(a0, a1)),
        SYS_CLOSE => result_to_ret(sys_close(a0)),
        SYS_READ => result_to_ret(sys_read(a0, a1, a2)),
        SYS_WRITE => result_to_ret(sys_write(a0, a1, a2)),
        SYS_IOCTL => result_to_ret(sys_ioctl(a0, a1, a2)),
        SYS_EXEC => result_to_ret(sys_exec(a0)),
        SYS_FORK => result_to_ret(sys_fork(tfr)),
        SYS_WAIT => result_to_ret(sys_wait(a0)),
        SYS_PIPE => result_to_ret(sys_pipe(a0)),
        _ => {
            crate::log_warn!("syscall: unknown number {}", number);
            Error::Inval.errno()
        }
    };
    tfr.set_a(0, ret as usize);
}

fn result_to_ret(r: Result<usize>) -> isize {
    match r {
        Ok(v) => v as isize,
        Err(e) => e.errno(),
    }
}

/// Copy a NUL-terminated user string after proving every byte readable.
fn user_str(ptr: usize) -> Result<String> {
    let mtag = process::current_mtag()?;
    let len = memory_validate_vstr(mtag, ptr, PteFlags::R)?;
    let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, len) };
    let s = core::str::from_utf8(bytes).map_err(|_| Error::Inval)?;
    Ok(String::from(s))
}

fn sys_msgout(msg_ptr: usize) -> Result<usize> {
    let msg = user_str(msg_ptr)?;
    let tid = crate::thread::running_thread();
    let name = crate::thread::thread_name(tid).unwrap_or_default();
    crate::println!("[{}:{}] {}", tid, name, msg);
    Ok(0)
}

fn sys_devopen(fd: usize, name_ptr: usize, instno: usize) -> Result<usize> {
    let name = user_str(name_ptr)?;
    let io = drivers::open(&name, instno)?;
    process::io_install(fd, io)?;
    Ok(0)
}

fn sys_fsopen(fd: usize, name_ptr: usize) -> Result<usize> {
    let name = user_str(name_ptr)?;
    let io = fs::open(&name)?;
    process::io_install(fd, io)?;
    Ok(0)
}

fn sys_close(fd: usize) -> Result<usize> {
    process::io_close(fd)?;
    Ok(0)
}

fn sys_read(fd: usize, buf_ptr: usize, len: usize) -> Result<usize> {
    let mtag = process::current_mtag()?;
    // The kernel stores into the user buffer, so it must be mapped
    // writable.
    memory_validate_vptr_len(mtag, buf_ptr, len, PteFlags::W)?;
    let io = process::io_get(fd)?;
    let buf = unsafe { core::slice::from_raw_parts_mut(buf_ptr as *mut u8, len) };
    io.read(buf)
}

fn sys_write(fd: usize, buf_ptr: usize, len: usize) -> Result<usize> {
    let mtag = process::current_mtag()?;
    memory_validate_vptr_len(mtag, buf_ptr, len, PteFlags::R)?;
    let io = process::io_get(fd)?;
    let buf = unsafe { core::slice::from_raw_parts(buf_ptr as *const u8, len) };
    // Whole-buffer semantics: short device writes loop until done.
    io::iowrite(&*io, buf)
}

fn sys_ioctl(fd: usize, cmd: usize, arg: usize) -> Result<usize> {
    if cmd == IOCTL_GETREFCNT {
        // Answered from the descriptor tables so the count reflects
        // exactly the slots holding the object.
        return process::io_refcnt(fd);
    }
    let io = process::io_get(fd)?;
    io.ctl(cmd, arg)
}

fn sys_exec(fd: usize) -> Result<usize> {
    let io = process::io_get(fd)?;
    // Returns only on failure.
    process::exec(io)?;
    unreachable!("exec returned without error");
}

fn sys_fork(tfr: &TrapFrame) -> Result<usize> {
    process::fork(tfr)
}

fn sys_wait(tid: usize) -> Result<usize> {
    process::wait(tid)
}

fn sys_pipe(fd: usize) -> Result<usize> {
    let pipe = Pipe::new();
    process::io_install(fd, pipe)?;
    Ok(0)
}

pub fn init() {
    crate::log_info!("Syscall interface initialized.");
}
