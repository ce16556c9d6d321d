//! Kernel threads: a fixed-slot table, a FIFO ready list, condition
//! variables with broadcast wake-up, and the suspension machinery that
//! everything above (processes, pipes, syscalls) blocks through.

pub mod context;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::cpu;
use crate::error::{Error, Result};
use crate::memory::{self, MTag, PAGE_SIZE};
use crate::trap::{TrapFrame, STACK_ANCHOR_SIZE, TRAP_FRAME_SIZE};
use context::Context;

/// Thread table capacity.
pub const NTHR: usize = 16;

/// One page of kernel stack per thread.
pub const KSTACK_SIZE: usize = PAGE_SIZE;

const ANCHOR_OFFSET: usize = KSTACK_SIZE - STACK_ANCHOR_SIZE;
const TRAP_FRAME_OFFSET: usize = ANCHOR_OFFSET - TRAP_FRAME_SIZE;

pub type Tid = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Slot claimed, context not yet runnable.
    Uninit,
    /// Parked outside the scheduler (reserved).
    #[allow(dead_code)]
    Stopped,
    Waiting,
    Running,
    Ready,
    Exited,
}

#[repr(C, align(16))]
pub struct KernelStack([u8; KSTACK_SIZE]);

/// Heap-allocate a zeroed kernel stack without staging it on the caller's
/// own (page-sized) stack.
fn alloc_kstack() -> Box<KernelStack> {
    unsafe {
        let layout = core::alloc::Layout::new::<KernelStack>();
        let ptr = alloc::alloc::alloc_zeroed(layout) as *mut KernelStack;
        assert!(!ptr.is_null(), "kernel stack allocation failed");
        Box::from_raw(ptr)
    }
}

pub struct Thread {
    pub id: Tid,
    pub name: String,
    pub state: ThreadState,
    /// Owning process, if this thread carries a user address space.
    pub process: Option<usize>,
    /// Cached root of the owning process's address space, installed on
    /// every switch to this thread.
    pub mspace: Option<MTag>,
    pub parent: Option<Tid>,
    context: Context,
    kstack: Option<Box<KernelStack>>,
    /// Name of the condition currently waited on, for diagnostics.
    pub waiting_on: Option<&'static str>,
    /// Broadcast whenever one of this thread's children exits.
    pub child_exit: Arc<Condition>,
}

impl Thread {
    fn stack_base(&self) -> usize {
        self.kstack
            .as_ref()
            .map(|k| k.0.as_ptr() as usize)
            .expect("thread has no kernel stack")
    }

    /// Address of the stack anchor at the top of the kernel stack.
    pub fn anchor_base(&self) -> usize {
        self.stack_base() + ANCHOR_OFFSET
    }

    /// Address of this thread's trap frame, directly below the anchor.
    pub fn trap_frame_base(&self) -> usize {
        self.stack_base() + TRAP_FRAME_OFFSET
    }
}

pub struct ThreadTable {
    slots: [Option<Box<Thread>>; NTHR],
    /// FIFO of `Ready` thread ids.
    ready: VecDeque<Tid>,
    current: Tid,
    /// Thread we most recently switched away from; its stack is reclaimed
    /// once it is off-CPU and `Exited`.
    departed: Tid,
}

impl ThreadTable {
    fn new() -> Self {
        ThreadTable {
            slots: core::array::from_fn(|_| None),
            ready: VecDeque::new(),
            current: 0,
            departed: 0,
        }
    }

    fn slot(&self, tid: Tid) -> Option<&Thread> {
        self.slots.get(tid).and_then(|s| s.as_deref())
    }

    fn slot_mut(&mut self, tid: Tid) -> &mut Thread {
        self.slots[tid].as_deref_mut().expect("no thread in slot")
    }

    fn free_slot(&self) -> Option<Tid> {
        self.slots.iter().position(|s| s.is_none())
    }
}

lazy_static! {
    static ref THREADS: Mutex<ThreadTable> = Mutex::new(ThreadTable::new());
}

/// Turn the boot flow into thread 0 and start the idle thread.
pub fn init() {
    cpu::without_interrupts(|| {
        let mut tab = THREADS.lock();
        tab.slots[0] = Some(Box::new(Thread {
            id: 0,
            name: String::from("main"),
            state: ThreadState::Running,
            process: None,
            mspace: None,
            parent: None,
            context: Context::empty(),
            kstack: None,
            waiting_on: None,
            child_exit: Arc::new(Condition::new("child_exit")),
        }));
        tab.current = 0;
    });

    let idle = spawn("idle", idle_main, 0).expect("spawning the idle thread");
    cpu::without_interrupts(|| {
        // The idle thread belongs to nobody; it is never joined.
        THREADS.lock().slot_mut(idle).parent = None;
    });

    crate::log_info!("Thread table initialized, idle thread ready.");
}

/// Allocate a slot and a kernel-stack page for a new thread that will
/// enter `entry(arg)` on its first scheduled execution, and enqueue it at
/// the ready-list tail.
pub fn spawn(name: &str, entry: fn(usize), arg: usize) -> Result<Tid> {
    let kstack = alloc_kstack();
    cpu::without_interrupts(|| {
        let mut tab = THREADS.lock();
        let tid = tab.free_slot().ok_or(Error::Again)?;
        let parent = tab.current;

        let mut thread = Box::new(Thread {
            id: tid,
            name: String::from(name),
            state: ThreadState::Uninit,
            process: None,
            mspace: None,
            parent: Some(parent),
            context: Context::empty(),
            kstack: Some(kstack),
            waiting_on: None,
            child_exit: Arc::new(Condition::new("child_exit")),
        });

        let anchor = thread.anchor_base();
        let thread_ptr = &mut *thread as *mut Thread as usize;
        unsafe { *(anchor as *mut usize) = thread_ptr };
        thread.context = Context::first_run(entry as usize, arg, anchor, thread_ptr);
        thread.state = ThreadState::Ready;

        tab.slots[tid] = Some(thread);
        tab.ready.push_back(tid);
        Ok(tid)
    })
}

/// Clone a slot for a fork child: fresh kernel stack, the parent's trap
/// frame copied to the mirrored offset with its `a0` slot zeroed, and a
/// context that resumes in the fork trampoline. The child is left `Ready`
/// but not enqueued; `switch_to` runs it immediately.
pub fn spawn_forked(pid: usize, mtag: MTag, parent_tfr: &TrapFrame) -> Result<Tid> {
    let kstack = alloc_kstack();
    cpu::without_interrupts(|| {
        let mut tab = THREADS.lock();
        let tid = tab.free_slot().ok_or(Error::Again)?;
        let parent = tab.current;
        let name = tab.slot(parent).expect("forking from a dead thread").name.clone();

        let mut thread = Box::new(Thread {
            id: tid,
            name,
            state: ThreadState::Uninit,
            process: Some(pid),
            mspace: Some(mtag),
            parent: Some(parent),
            context: Context::empty(),
            kstack: Some(kstack),
            waiting_on: None,
            child_exit: Arc::new(Condition::new("child_exit")),
        });

        let anchor = thread.anchor_base();
        let thread_ptr = &mut *thread as *mut Thread as usize;
        unsafe { *(anchor as *mut usize) = thread_ptr };

        let tfr_base = thread.trap_frame_base();
        unsafe {
            let child_tfr = &mut *(tfr_base as *mut TrapFrame);
            *child_tfr = *parent_tfr;
            // Return-value divergence: the child observes 0 from fork.
            child_tfr.set_a(0, 0);
        }
        thread.context = Context::forked(tfr_base, thread_ptr);
        thread.state = ThreadState::Ready;

        tab.slots[tid] = Some(thread);
        Ok(tid)
    })
}

pub fn running_thread() -> Tid {
    cpu::without_interrupts(|| THREADS.lock().current)
}

pub fn thread_name(tid: Tid) -> Option<String> {
    cpu::without_interrupts(|| THREADS.lock().slot(tid).map(|t| t.name.clone()))
}

pub fn thread_process(tid: Tid) -> Option<usize> {
    cpu::without_interrupts(|| THREADS.lock().slot(tid).and_then(|t| t.process))
}

/// Attach `tid` to a process; the cached `mtag` is what `suspend_self`
/// installs whenever this thread is scheduled.
pub fn thread_set_process(tid: Tid, pid: usize, mtag: MTag) {
    cpu::without_interrupts(|| {
        let mut tab = THREADS.lock();
        let t = tab.slot_mut(tid);
        t.process = Some(pid);
        t.mspace = Some(mtag);
    });
}

/// Detach the current thread from its process (used on process exit,
/// after the kernel space has been re-installed).
pub fn thread_clear_process(tid: Tid) {
    cpu::without_interrupts(|| {
        let mut tab = THREADS.lock();
        let t = tab.slot_mut(tid);
        t.process = None;
        t.mspace = None;
    });
}

/// Voluntarily give up the CPU while remaining runnable.
pub fn yield_now() {
    cpu::without_interrupts(suspend_self);
}

/// Preemption entry from the timer: back off when the interrupted code
/// owns the thread table, otherwise behave like `yield_now`. Interrupts
/// are already masked in trap context.
pub fn try_yield_now() {
    cpu::without_interrupts(|| {
        match THREADS.try_lock() {
            Some(tab) => drop(tab),
            // The interrupted code is inside the scheduler.
            None => return,
        }
        suspend_self();
    });
}

/// Park the current thread and run the ready-list head. Must be entered
/// with interrupts disabled; they stay disabled across the switch and are
/// restored by whatever the resumed thread was doing when it suspended.
fn suspend_self() {
    let (old_ctx, new_ctx) = {
        let mut tab = THREADS.lock();
        let cur = tab.current;

        let next = match tab.ready.pop_front() {
            Some(t) => t,
            None => {
                // Nothing else runnable. Fine for a yielding thread;
                // fatal otherwise, since the idle thread belongs on the
                // list whenever anyone blocks.
                assert_eq!(
                    tab.slot_mut(cur).state,
                    ThreadState::Running,
                    "no runnable threads"
                );
                return;
            }
        };
        assert_eq!(tab.slot_mut(next).state, ThreadState::Ready);

        tab.slot_mut(next).state = ThreadState::Running;
        if tab.slot_mut(cur).state == ThreadState::Running {
            tab.slot_mut(cur).state = ThreadState::Ready;
            tab.ready.push_back(cur);
        }
        tab.current = next;
        tab.departed = cur;

        if let Some(mtag) = tab.slot_mut(next).mspace {
            memory::memory_space_switch(mtag);
        }

        let old_ctx = &mut tab.slot_mut(cur).context as *mut Context;
        let new_ctx = &tab.slot_mut(next).context as *const Context;
        (old_ctx, new_ctx)
    };
    unsafe { context::switch_context(old_ctx, new_ctx) };
    reap_departed();
}

/// Run `next` immediately, demoting the current thread to the ready-list
/// tail. Fork uses this so the child executes first.
pub fn switch_to(next: Tid) {
    cpu::without_interrupts(|| {
        let (old_ctx, new_ctx) = {
            let mut tab = THREADS.lock();
            let cur = tab.current;
            assert_eq!(tab.slot_mut(next).state, ThreadState::Ready);

            tab.slot_mut(next).state = ThreadState::Running;
            tab.slot_mut(cur).state = ThreadState::Ready;
            tab.ready.push_back(cur);
            tab.current = next;
            tab.departed = cur;

            if let Some(mtag) = tab.slot_mut(next).mspace {
                memory::memory_space_switch(mtag);
            }

            let old_ctx = &mut tab.slot_mut(cur).context as *mut Context;
            let new_ctx = &tab.slot_mut(next).context as *const Context;
            (old_ctx, new_ctx)
        };
        unsafe { context::switch_context(old_ctx, new_ctx) };
        reap_departed();
    });
}

/// Free the kernel stack of the thread we just switched away from, if it
/// will never run again. Its slot survives until `join` recycles it.
fn reap_departed() {
    let stack = {
        let mut tab = THREADS.lock();
        let prev = tab.departed;
        match tab.slots.get_mut(prev).and_then(|s| s.as_deref_mut()) {
            Some(t) if t.state == ThreadState::Exited => t.kstack.take(),
            _ => None,
        }
    };
    drop(stack);
}

/// Post-switch bookkeeping for spawned threads entering through the start
/// shim rather than returning out of `suspend_self`.
#[no_mangle]
extern "C" fn thread_entry_prologue() {
    reap_departed();
    cpu::interrupts_enable();
}

/// Fork children keep interrupts masked; `sret` re-enables them from the
/// restored frame.
#[no_mangle]
extern "C" fn fork_entry_prologue() {
    reap_departed();
}

#[no_mangle]
extern "C" fn thread_entry_finish() -> ! {
    exit_current()
}

/// Mark the current thread `Exited`, wake the parent's `child_exit`
/// waiters, and never run again. The stack page is reclaimed by the next
/// thread to run; the slot by `join`.
pub fn exit_current() -> ! {
    cpu::interrupts_disable();
    let parent_cond = {
        let mut tab = THREADS.lock();
        let cur = tab.current;
        tab.slot_mut(cur).state = ThreadState::Exited;
        let parent = tab.slot_mut(cur).parent;
        parent.and_then(|p| tab.slot(p).map(|t| t.child_exit.clone()))
    };
    if let Some(cond) = parent_cond {
        cond.broadcast();
    }
    suspend_self();
    unreachable!("exited thread rescheduled");
}

enum JoinCheck {
    NoSuch,
    NotChild,
    Exited,
    Alive,
}

/// Wait until child `tid` exits, then recycle its slot and return its id.
pub fn join(tid: Tid) -> Result<Tid> {
    loop {
        let done = cpu::without_interrupts(|| {
            let mut tab = THREADS.lock();
            let cur = tab.current;
            let check = match tab.slot(tid) {
                None => JoinCheck::NoSuch,
                Some(t) if t.parent != Some(cur) => JoinCheck::NotChild,
                Some(t) if t.state == ThreadState::Exited => JoinCheck::Exited,
                Some(_) => JoinCheck::Alive,
            };
            match check {
                JoinCheck::NoSuch => return Err(Error::Inval),
                JoinCheck::NotChild => return Err(Error::NoChild),
                JoinCheck::Exited => {
                    recycle_thread(&mut tab, tid);
                    return Ok(true);
                }
                JoinCheck::Alive => {}
            }
            let cond = tab.slot_mut(cur).child_exit.clone();
            drop(tab);
            // Interrupts stay masked from the check through the wait-list
            // link, so the exit broadcast cannot slip in between.
            cond.wait();
            Ok(false)
        })?;
        if done {
            return Ok(tid);
        }
    }
}

/// Reap exactly one exited child, waiting if none has exited yet.
/// Panics when the caller has no children at all.
pub fn join_any() -> Tid {
    join_any_checked().expect("join_any: thread has no children")
}

/// Like `join_any`, but reports childlessness instead of panicking; the
/// `wait` syscall goes through this.
pub fn join_any_checked() -> Result<Tid> {
    loop {
        let reaped = cpu::without_interrupts(|| {
            let mut tab = THREADS.lock();
            let cur = tab.current;

            let mut have_child = false;
            let mut exited = None;
            for tid in 0..NTHR {
                if let Some(t) = tab.slot(tid) {
                    if t.parent == Some(cur) {
                        have_child = true;
                        if t.state == ThreadState::Exited {
                            exited = Some(tid);
                            break;
                        }
                    }
                }
            }
            if !have_child {
                return Err(Error::NoChild);
            }
            if let Some(tid) = exited {
                recycle_thread(&mut tab, tid);
                return Ok(Some(tid));
            }

            let cond = tab.slot_mut(cur).child_exit.clone();
            drop(tab);
            cond.wait();
            Ok(None)
        })?;
        if let Some(tid) = reaped {
            return Ok(tid);
        }
    }
}

/// Release a dead thread's slot. Any children it left behind are
/// re-parented to its own parent, so no dangling parent links survive.
fn recycle_thread(tab: &mut ThreadTable, tid: Tid) {
    let dead = tab.slots[tid].take().expect("recycling an empty slot");
    debug_assert_eq!(dead.state, ThreadState::Exited);
    for slot in tab.slots.iter_mut() {
        if let Some(t) = slot.as_deref_mut() {
            if t.parent == Some(tid) {
                t.parent = dead.parent;
            }
        }
    }
}

/// Enter user mode for the first time on the current thread: build a trap
/// frame at the fixed offset below the anchor and restore it.
pub fn jump_to_user(entry: usize, user_sp: usize) -> ! {
    let tfr_base = cpu::without_interrupts(|| {
        let tab = THREADS.lock();
        tab.slot(tab.current)
            .expect("no current thread")
            .trap_frame_base()
    });
    let tfr = tfr_base as *mut TrapFrame;
    unsafe {
        let frame = &mut *tfr;
        *frame = TrapFrame::zeroed();
        frame.set_sp(user_sp);
        frame.sepc = entry;
        frame.sstatus = cpu::user_sstatus();
        enter_user(tfr)
    }
}

#[cfg(target_arch = "riscv64")]
unsafe fn enter_user(tfr: *mut TrapFrame) -> ! {
    crate::trap::_trap_user_exit(tfr)
}

#[cfg(not(target_arch = "riscv64"))]
unsafe fn enter_user(_tfr: *mut TrapFrame) -> ! {
    unreachable!("user-mode entry on host")
}

/// Idle thread body: yield while work exists; otherwise halt until an
/// interrupt arrives. Emptiness is re-checked with interrupts disabled to
/// close the race against an interrupt readying a thread between the test
/// and the halt.
fn idle_main(_arg: usize) {
    loop {
        while cpu::without_interrupts(|| !THREADS.lock().ready.is_empty()) {
            yield_now();
        }
        cpu::interrupts_disable();
        let still_empty = {
            let tab = THREADS.lock();
            tab.ready.is_empty()
        };
        if still_empty {
            cpu::wait_for_interrupt();
        }
        cpu::interrupts_enable();
    }
}

// ── Condition variables ──

/// A broadcast-only wait queue. No predicate is stored; wakers re-check
/// their own predicate after `wait` returns.
pub struct Condition {
    name: &'static str,
    waiters: Mutex<VecDeque<Tid>>,
}

impl Condition {
    pub const fn new(name: &'static str) -> Condition {
        Condition {
            name,
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Block the current thread on this condition. `unlock` runs after
    /// the caller is linked to the wait list and marked `Waiting`, but
    /// before suspension. Pass the guard of the resource being waited
    /// for, so release and sleep are atomic with respect to broadcasts.
    pub fn wait_then(&self, unlock: impl FnOnce()) {
        cpu::without_interrupts(|| {
            {
                let mut tab = THREADS.lock();
                let cur = tab.current;
                let t = tab.slot_mut(cur);
                debug_assert_eq!(t.state, ThreadState::Running);
                t.state = ThreadState::Waiting;
                t.waiting_on = Some(self.name);
                self.waiters.lock().push_back(cur);
            }
            unlock();
            suspend_self();
        });
    }

    pub fn wait(&self) {
        self.wait_then(|| {});
    }

    /// Promote every waiter to `Ready`, appending to the ready-list tail
    /// in their wait order.
    pub fn broadcast(&self) {
        cpu::without_interrupts(|| {
            let woken = {
                let mut waiters = self.waiters.lock();
                core::mem::take(&mut *waiters)
            };
            if woken.is_empty() {
                return;
            }
            let mut tab = THREADS.lock();
            for tid in woken {
                if let Some(t) = tab.slots.get_mut(tid).and_then(|s| s.as_deref_mut()) {
                    if t.state == ThreadState::Waiting {
                        t.state = ThreadState::Ready;
                        t.waiting_on = None;
                        tab.ready.push_back(tid);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(tab: &mut ThreadTable, tid: Tid, parent: Option<Tid>, state: ThreadState) {
        tab.slots[tid] = Some(Box::new(Thread {
            id: tid,
            name: String::from("t"),
            state,
            process: None,
            mspace: None,
            parent,
            context: Context::empty(),
            kstack: None,
            waiting_on: None,
            child_exit: Arc::new(Condition::new("child_exit")),
        }));
    }

    #[test]
    fn free_slot_scans_in_order() {
        let mut tab = ThreadTable::new();
        assert_eq!(tab.free_slot(), Some(0));
        insert(&mut tab, 0, None, ThreadState::Running);
        insert(&mut tab, 1, Some(0), ThreadState::Ready);
        assert_eq!(tab.free_slot(), Some(2));
        for tid in 2..NTHR {
            insert(&mut tab, tid, Some(0), ThreadState::Ready);
        }
        assert_eq!(tab.free_slot(), None);
    }

    #[test]
    fn recycle_reparents_orphans() {
        let mut tab = ThreadTable::new();
        insert(&mut tab, 0, None, ThreadState::Running);
        insert(&mut tab, 1, Some(0), ThreadState::Exited);
        insert(&mut tab, 2, Some(1), ThreadState::Ready);
        insert(&mut tab, 3, Some(1), ThreadState::Waiting);
        recycle_thread(&mut tab, 1);
        assert!(tab.slots[1].is_none());
        // The dead thread's children now answer to its parent.
        assert_eq!(tab.slot(2).unwrap().parent, Some(0));
        assert_eq!(tab.slot(3).unwrap().parent, Some(0));
    }

    #[test]
    fn stack_layout_offsets() {
        // Anchor at the stack top, trap frame right below, both 16-byte
        // aligned so the hand-offs in the trap assembly line up.
        assert_eq!(ANCHOR_OFFSET, KSTACK_SIZE - 16);
        assert_eq!(ANCHOR_OFFSET - TRAP_FRAME_OFFSET, TRAP_FRAME_SIZE);
        assert_eq!(ANCHOR_OFFSET % 16, 0);
        assert_eq!(TRAP_FRAME_OFFSET % 16, 0);
    }
}
