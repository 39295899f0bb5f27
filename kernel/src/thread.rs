//! Task management: control blocks, spawning and the scheduler.
//!
//! A task's control block lives in the first bytes of a single kernel page;
//! the rest of the page is its kernel stack, growing down toward the TCB.
//! Masking any kernel stack pointer to its page base therefore recovers the
//! running task — that is the only legal way to obtain "current".
//!
//! Scheduling is preemptive priority-quantum round-robin on one CPU: the
//! static priority doubles as the quantum refill, the timer tick burns the
//! quantum, and blocking primitives reschedule voluntarily. Wakeups go to
//! the *front* of the ready queue to bound wakeup latency; `yield` and
//! quantum expiry requeue at the tail.

use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ptr;

use crate::arch::asm;
use crate::arch::switch::switch_to;
use crate::arch::trap::IntrFrame;
use crate::elem2entry;
use crate::interrupts::{self, IntrStatus};
use crate::list::{List, ListElem};
use crate::memory::{self, MemBlockDesc, VirtualRegion, DESC_CNT, PAGE_SIZE};
use crate::sync::Lock;

pub const TASK_NAME_LEN: usize = 16;
/// Per-task descriptor slots; 0–2 are stdin/stdout/stderr.
pub const MAX_FILES_OPEN_PER_PROC: usize = 8;
/// Trailing canary; the kernel stack grows toward it.
const STACK_MAGIC: u32 = 0x1997_1216;
const MAIN_THREAD_PRIO: u8 = 31;
const IDLE_THREAD_PRIO: u8 = 10;

pub type Pid = i16;

/// A spawned kernel thread's body.
pub type ThreadFunc = fn(usize);

/// Task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskStatus {
    Running,
    Ready,
    Blocked,
    Waiting,
    Hanging,
    Died,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "RUNNING",
            TaskStatus::Ready => "READY",
            TaskStatus::Blocked => "BLOCKED",
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Hanging => "HANGING",
            TaskStatus::Died => "DIED",
        }
    }
}

/// Task control block, at the base of the task's kernel page.
#[repr(C)]
pub struct Task {
    /// Saved kernel stack pointer. Must stay the first field: `switch_to`
    /// stores through the TCB pointer without an offset.
    pub self_kstack: u32,
    pub pid: Pid,
    pub parent_pid: Pid,
    pub status: TaskStatus,
    pub priority: u8,
    /// Remaining quantum ticks.
    pub ticks: u8,
    pub elapsed_ticks: u32,
    pub name: [u8; TASK_NAME_LEN],
    /// Link for whatever queue the task currently waits on (ready queue or
    /// a semaphore's waiters).
    pub general_tag: ListElem,
    /// Link for the global all-tasks list.
    pub all_list_tag: ListElem,
    /// Page-directory virtual address; 0 for pure kernel threads.
    pub pgdir: u32,
    pub userprog_vaddr: VirtualRegion,
    pub u_block_descs: [MemBlockDesc; DESC_CNT],
    /// Indices into the global open-file table, or 0–2 for the std streams,
    /// or -1 for a free slot.
    pub fd_table: [i32; MAX_FILES_OPEN_PER_PROC],
    /// Inode number of the working directory.
    pub cwd_inode_nr: i32,
    pub stack_magic: u32,
}

impl Task {
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(TASK_NAME_LEN);
        core::str::from_utf8(&self.name[..end]).unwrap_or("?")
    }

    pub fn stack_guard_ok(&self) -> bool {
        self.stack_magic == STACK_MAGIC
    }
}

/// Frame popped by `switch_to`, laid down below the interrupt frame when a
/// task is first built. `eip` is the spawn trampoline on the first run.
#[repr(C)]
struct ThreadStack {
    ebp: u32,
    ebx: u32,
    edi: u32,
    esi: u32,
    eip: u32,
    /// Fake return address seen by the trampoline, so `function` and
    /// `func_arg` sit where the cdecl ABI expects arguments.
    ret_addr: u32,
    function: u32,
    func_arg: u32,
}

struct ListCell(UnsafeCell<List>);
unsafe impl Sync for ListCell {}

struct TaskPtr(UnsafeCell<*mut Task>);
unsafe impl Sync for TaskPtr {}

/// Ready queue: only tasks in `TaskStatus::Ready`.
static READY_LIST: ListCell = ListCell(UnsafeCell::new(List::new()));
/// Every task, whatever its state.
static ALL_LIST: ListCell = ListCell(UnsafeCell::new(List::new()));
static MAIN_THREAD: TaskPtr = TaskPtr(UnsafeCell::new(ptr::null_mut()));
static IDLE_THREAD: TaskPtr = TaskPtr(UnsafeCell::new(ptr::null_mut()));

static PID_LOCK: Lock = Lock::new();

struct PidCell(UnsafeCell<Pid>);
unsafe impl Sync for PidCell {}
static NEXT_PID: PidCell = PidCell(UnsafeCell::new(0));

fn ready_list() -> &'static mut List {
    unsafe { &mut *READY_LIST.0.get() }
}

fn all_list() -> &'static mut List {
    unsafe { &mut *ALL_LIST.0.get() }
}

/// The running task, recovered from the stack pointer's page base.
pub fn running_task() -> *mut Task {
    (asm::read_esp() & 0xffff_f000) as *mut Task
}

pub fn current_pid() -> Pid {
    unsafe { (*running_task()).pid }
}

fn allocate_pid() -> Pid {
    PID_LOCK.acquire();
    let pid = unsafe {
        *NEXT_PID.0.get() += 1;
        *NEXT_PID.0.get()
    };
    PID_LOCK.release();
    pid
}

/// Pid for a forked child.
pub fn fork_pid() -> Pid {
    allocate_pid()
}

/// Trampoline every kernel thread starts in: interrupts back on (the switch
/// happened with them masked), then the thread body.
extern "C" fn kernel_thread_entry(function: ThreadFunc, arg: usize) -> ! {
    interrupts::enable();
    function(arg);
    panic!("kernel thread '{}' returned", unsafe { (*running_task()).name_str() });
}

/// Lay the interrupt-stack placeholder and the first-run `ThreadStack` onto
/// a fresh task's kernel stack.
pub fn create(task: *mut Task, function: ThreadFunc, arg: usize) {
    unsafe {
        let mut kstack = (*task).self_kstack;
        kstack -= size_of::<IntrFrame>() as u32;
        kstack -= size_of::<ThreadStack>() as u32;
        let ts = kstack as *mut ThreadStack;
        (*ts).ebp = 0;
        (*ts).ebx = 0;
        (*ts).edi = 0;
        (*ts).esi = 0;
        (*ts).eip = kernel_thread_entry as u32;
        (*ts).ret_addr = 0;
        (*ts).function = function as u32;
        (*ts).func_arg = arg as u32;
        (*task).self_kstack = kstack;
    }
}

/// Fill in a fresh TCB.
pub fn init_task(task: *mut Task, name: &str, priority: u8) {
    unsafe {
        // The boot thread's page holds loader leftovers; start from zero.
        ptr::write_bytes(task as *mut u8, 0, size_of::<Task>());
        (*task).pid = allocate_pid();
        let bytes = name.as_bytes();
        let len = bytes.len().min(TASK_NAME_LEN - 1);
        (&mut (*task).name)[..len].copy_from_slice(&bytes[..len]);
        (*task).status = if task == *MAIN_THREAD.0.get() {
            TaskStatus::Running
        } else {
            TaskStatus::Ready
        };
        (*task).priority = priority;
        (*task).ticks = priority;
        (*task).elapsed_ticks = 0;
        (*task).pgdir = 0;
        (*task).self_kstack = task as u32 + PAGE_SIZE as u32;
        (*task).fd_table[0] = 0;
        (*task).fd_table[1] = 1;
        (*task).fd_table[2] = 2;
        for fd in 3..MAX_FILES_OPEN_PER_PROC {
            (*task).fd_table[fd] = -1;
        }
        (*task).cwd_inode_nr = 0;
        (*task).parent_pid = -1;
        (*task).stack_magic = STACK_MAGIC;
    }
}

/// Spawn a kernel thread: one page for TCB + stack, first-run frames, both
/// global lists.
pub fn start(name: &str, priority: u8, function: ThreadFunc, arg: usize) -> *mut Task {
    let task = memory::get_kernel_pages(1).expect("out of kernel pages for TCB") as *mut Task;
    init_task(task, name, priority);
    create(task, function, arg);
    enqueue(task);
    task
}

/// Queue a fully built task on the ready and all-tasks lists.
pub fn enqueue(task: *mut Task) {
    unsafe {
        assert!(!ready_list().find(&(*task).general_tag));
        ready_list().push_back(&mut (*task).general_tag);
        assert!(!all_list().find(&(*task).all_list_tag));
        all_list().push_back(&mut (*task).all_list_tag);
    }
}

/// Adopt the boot thread of execution as the `main` task. Its PCB page was
/// reserved by the loader; only the all-tasks list learns about it since it
/// is already running.
fn make_main_thread() {
    let main = running_task();
    unsafe {
        *MAIN_THREAD.0.get() = main;
    }
    init_task(main, "main", MAIN_THREAD_PRIO);
    unsafe {
        assert!(!all_list().find(&(*main).all_list_tag));
        all_list().push_back(&mut (*main).all_list_tag);
    }
}

/// The idle task: parks itself, and halts whenever the scheduler wakes it
/// for lack of other work.
fn idle(_arg: usize) {
    loop {
        block(TaskStatus::Blocked);
        // hlt must run with interrupts on or the machine wedges.
        asm::sti_hlt();
    }
}

/// Pick and switch to the next task. Interrupts must already be off; called
/// from the timer tick on quantum expiry and from every blocking primitive.
pub fn schedule() {
    assert_eq!(interrupts::get_status(), IntrStatus::Off);

    let cur = running_task();
    unsafe {
        assert!((*cur).stack_guard_ok(), "kernel stack overflow");
        if (*cur).status == TaskStatus::Running {
            // Quantum ran out: back of the queue, fresh quantum.
            assert!(!ready_list().find(&(*cur).general_tag));
            ready_list().push_back(&mut (*cur).general_tag);
            (*cur).ticks = (*cur).priority;
            (*cur).status = TaskStatus::Ready;
        }

        if ready_list().is_empty() {
            unblock(*IDLE_THREAD.0.get());
        }
        let next = elem2entry!(Task, general_tag, ready_list().pop_front());
        (*next).status = TaskStatus::Running;
        crate::process::activate(next);
        switch_to(cur, next);
    }
}

/// Park the caller in `status` and reschedule; it will not run again until
/// someone calls [`unblock`] on it.
pub fn block(status: TaskStatus) {
    assert!(matches!(
        status,
        TaskStatus::Blocked | TaskStatus::Waiting | TaskStatus::Hanging
    ));
    let old = interrupts::disable();
    let cur = running_task();
    unsafe {
        (*cur).status = status;
    }
    schedule();
    // Runs when the task is scheduled again.
    interrupts::set_status(old);
}

/// Make a parked task runnable, at the *front* of the ready queue so a
/// wakeup runs with minimum latency.
pub fn unblock(task: *mut Task) {
    let old = interrupts::disable();
    unsafe {
        assert!(matches!(
            (*task).status,
            TaskStatus::Blocked | TaskStatus::Waiting | TaskStatus::Hanging
        ));
        assert!(
            !ready_list().find(&(*task).general_tag),
            "unblock: task already on ready queue"
        );
        ready_list().push_front(&mut (*task).general_tag);
        (*task).status = TaskStatus::Ready;
    }
    interrupts::set_status(old);
}

/// Voluntarily give up the CPU, staying runnable at the back of the queue.
pub fn yield_now() {
    let cur = running_task();
    let old = interrupts::disable();
    unsafe {
        assert!(!ready_list().find(&(*cur).general_tag));
        ready_list().push_back(&mut (*cur).general_tag);
        (*cur).status = TaskStatus::Ready;
    }
    schedule();
    interrupts::set_status(old);
}

/// Formatted task listing for the `ps` syscall.
pub fn ps() {
    crate::console_println!("{:<5} {:<5} {:<8} {:<8} {:<8} NAME", "PID", "PPID", "STAT", "TICKS", "ELAPSED");
    for elem in all_list().iter() {
        let task = elem2entry!(Task, all_list_tag, elem);
        unsafe {
            crate::console_println!(
                "{:<5} {:<5} {:<8} {:<8} {:<8} {}",
                (*task).pid,
                (*task).parent_pid,
                (*task).status.as_str(),
                (*task).ticks,
                (*task).elapsed_ticks,
                (*task).name_str()
            );
        }
    }
}

/// Bring up multitasking: lists, pid lock, the `main` task and `idle`.
pub fn init() {
    ready_list().init();
    all_list().init();
    PID_LOCK.init();
    make_main_thread();
    let idle_task = start("idle", IDLE_THREAD_PRIO, idle, 0);
    unsafe {
        *IDLE_THREAD.0.get() = idle_task;
    }
    crate::log!("[THREAD] multitasking ready, main pid {}", current_pid());
}
