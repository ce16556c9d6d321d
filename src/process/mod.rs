//! Process lifecycle: a user address space plus an open-object table,
//! carried by exactly one kernel thread. `fork` physically duplicates the
//! space and descriptor set; `exec` replaces the space with a fresh ELF
//! image; `exit` releases every descriptor and reclaims the space.

use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::io::IoRef;
use crate::loader;
use crate::memory::{
    self, memory_space_clone, memory_space_create, memory_space_destroy, memory_space_switch,
    MTag, PteFlags,
};
use crate::thread::{self, Tid};
use crate::trap::TrapFrame;

/// Process table capacity.
pub const NPROC: usize = 16;
/// Descriptors per process.
pub const NIO: usize = 16;

pub type Pid = usize;

pub struct Process {
    pub id: Pid,
    /// Root page-table handle for the user address space.
    pub mtag: MTag,
    /// Small-integer descriptors onto shared I/O objects. An object's
    /// reference count is the number of slots holding it, across every
    /// process.
    pub iotab: [Option<IoRef>; NIO],
    /// Spans demand-mapped on page fault (the user stack region).
    pub on_demand: Vec<(usize, usize, PteFlags)>,
}

struct ProcessTable {
    slots: [Option<Process>; NPROC],
}

impl ProcessTable {
    fn new() -> Self {
        ProcessTable {
            slots: core::array::from_fn(|_| None),
        }
    }
}

lazy_static! {
    static ref PROCS: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());
}

fn alloc_slot(mtag: MTag) -> Result<Pid> {
    let mut tab = PROCS.lock();
    let pid = tab
        .slots
        .iter()
        .position(|s| s.is_none())
        .ok_or(Error::Again)?;
    tab.slots[pid] = Some(Process {
        id: pid,
        mtag,
        iotab: core::array::from_fn(|_| None),
        on_demand: Vec::new(),
    });
    Ok(pid)
}

fn current_pid() -> Result<Pid> {
    thread::thread_process(thread::running_thread()).ok_or(Error::BadFd)
}

/// Run `f` on the current thread's process.
pub fn with_current<R>(f: impl FnOnce(&mut Process) -> Result<R>) -> Result<R> {
    let pid = current_pid()?;
    let mut tab = PROCS.lock();
    let proc = tab.slots[pid].as_mut().ok_or(Error::BadFd)?;
    f(proc)
}

/// The current process's address-space handle, for validating syscall
/// pointers.
pub fn current_mtag() -> Result<MTag> {
    with_current(|p| Ok(p.mtag))
}

// ── Descriptor-table operations ──

/// Install `io` at descriptor `fd`, which must be free.
pub fn io_install(fd: usize, io: IoRef) -> Result<()> {
    with_current(|p| {
        if fd >= NIO || p.iotab[fd].is_some() {
            return Err(Error::BadFd);
        }
        p.iotab[fd] = Some(io);
        Ok(())
    })
}

/// Clone the object behind `fd` (bumping its reference count) so the
/// caller can operate on it without holding any table lock.
pub fn io_get(fd: usize) -> Result<IoRef> {
    with_current(|p| {
        if fd >= NIO {
            return Err(Error::BadFd);
        }
        p.iotab[fd].clone().ok_or(Error::BadFd)
    })
}

/// Release descriptor `fd`; the object closes when its last holder drops.
pub fn io_close(fd: usize) -> Result<()> {
    let io = with_current(|p| {
        if fd >= NIO {
            return Err(Error::BadFd);
        }
        p.iotab[fd].take().ok_or(Error::BadFd)
    })?;
    drop(io);
    Ok(())
}

/// Reference count of the object behind `fd`, as observed from the
/// descriptor tables (no transient clone is taken).
pub fn io_refcnt(fd: usize) -> Result<usize> {
    with_current(|p| {
        if fd >= NIO {
            return Err(Error::BadFd);
        }
        p.iotab[fd]
            .as_ref()
            .map(Arc::strong_count)
            .ok_or(Error::BadFd)
    })
}

// ── Lifecycle ──

/// Attach a fresh process (empty descriptor table, empty address space)
/// to the current thread. The boot path uses this to give the init
/// thread a process before its first `exec`.
pub fn adopt_current_thread() -> Result<Pid> {
    let tid = thread::running_thread();
    if thread::thread_process(tid).is_some() {
        return Err(Error::Busy);
    }
    let mtag = memory_space_create()?;
    let pid = match alloc_slot(mtag) {
        Ok(pid) => pid,
        Err(e) => {
            memory_space_destroy(mtag);
            return Err(e);
        }
    };
    thread::thread_set_process(tid, pid, mtag);
    Ok(pid)
}

/// Replace the current process image with the ELF in `io` and enter it
/// in user mode. Returns only on failure; descriptors stay open across
/// the replacement.
pub fn exec(io: IoRef) -> Result<()> {
    let pid = current_pid()?;
    let tid = thread::running_thread();

    let new_mtag = memory_space_create()?;
    let image = match loader::elf::load(&*io, new_mtag) {
        Ok(image) => image,
        Err(e) => {
            memory_space_destroy(new_mtag);
            return Err(e);
        }
    };
    drop(io);

    let old_mtag = {
        let mut tab = PROCS.lock();
        let proc = tab.slots[pid].as_mut().ok_or(Error::BadFd)?;
        let old = proc.mtag;
        proc.mtag = new_mtag;
        proc.on_demand.clear();
        proc.on_demand.push(image.on_demand);
        old
    };

    thread::thread_set_process(tid, pid, new_mtag);
    memory_space_switch(new_mtag);
    memory_space_destroy(old_mtag);

    thread::jump_to_user(image.entry, image.stack_top)
}

/// Duplicate the current process. The child gets a physically copied
/// address space, a descriptor table of clones (reference counts bumped),
/// a fresh kernel stack carrying a copy of the parent's trap frame, and
/// runs first; the parent resumes later and receives the child's id.
pub fn fork(parent_tfr: &TrapFrame) -> Result<Tid> {
    let parent_pid = current_pid()?;

    let (parent_mtag, iotab, on_demand) = {
        let mut tab = PROCS.lock();
        let proc = tab.slots[parent_pid].as_mut().ok_or(Error::BadFd)?;
        (proc.mtag, proc.iotab.clone(), proc.on_demand.clone())
    };

    let child_mtag = memory_space_clone(parent_mtag)?;

    let child_pid = {
        let mut tab = PROCS.lock();
        match tab.slots.iter().position(|s| s.is_none()) {
            Some(pid) => {
                tab.slots[pid] = Some(Process {
                    id: pid,
                    mtag: child_mtag,
                    iotab,
                    on_demand,
                });
                pid
            }
            None => {
                drop(tab);
                memory_space_destroy(child_mtag);
                return Err(Error::Again);
            }
        }
    };

    let child_tid = match thread::spawn_forked(child_pid, child_mtag, parent_tfr) {
        Ok(tid) => tid,
        Err(e) => {
            let dead = PROCS.lock().slots[child_pid].take();
            drop(dead);
            memory_space_destroy(child_mtag);
            return Err(e);
        }
    };

    // Child first: switch directly; the parent continues here afterwards
    // and reports the child's id through its own trap frame.
    thread::switch_to(child_tid);
    Ok(child_tid)
}

/// Tear down the current process (descriptors, address space, slot) and
/// exit its thread. The thread-level exit broadcasts the parent's
/// `child_exit` condition.
pub fn exit_current() -> ! {
    let tid = thread::running_thread();
    if let Some(pid) = thread::thread_process(tid) {
        let proc = PROCS.lock().slots[pid].take();
        thread::thread_clear_process(tid);
        memory_space_switch(memory::kernel_space());
        if let Some(proc) = proc {
            memory_space_destroy(proc.mtag);
            // Dropping the table releases every descriptor; objects whose
            // count reaches zero close here.
            drop(proc);
        }
    }
    thread::exit_current()
}

/// Demand-map `va` if it falls in one of the current process's declared
/// ranges. Returns false when the fault is not recoverable.
pub fn handle_page_fault(va: usize) -> bool {
    let mapped = with_current(|p| Ok(memory::memory_handle_page_fault(p.mtag, va, &p.on_demand)));
    matches!(mapped, Ok(true))
}

/// Wait for a child: `tid == 0` reaps any child, otherwise the named
/// one. Wraps the thread-level join.
pub fn wait(tid: usize) -> Result<Tid> {
    if tid == 0 {
        thread::join_any_checked()
    } else {
        thread::join(tid)
    }
}
