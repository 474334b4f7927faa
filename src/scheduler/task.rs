use super::context::Context;
use super::stats::{Stats, Transition};

/// Size of the static task pool. Slot 0 is the idle task, slot 1 the init
/// task; the rest start on the free queue.
pub const NR_TASKS: usize = 10;

/// Per-slot kernel stack, in 64-bit words.
pub const KERNEL_STACK_SIZE: usize = 1024;

/// Time slice handed to a process when it is scheduled in, in timer ticks.
pub const DEFAULT_QUANTUM: u64 = 50;

/// Slot of the idle task (PID 0). Runs only when the ready queue is empty
/// and is never placed on it.
pub const IDLE: usize = 0;

/// Slot of the init task (PID 1), the process the kernel hands ring 3 to.
pub const INIT: usize = 1;

/// Unique process identifier. Assigned from a monotonically increasing
/// counter; 0 and 1 belong to the two boot processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(pub i32);

/// Process state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Run,
    Ready,
    Blocked,
    Free,
}

/// The queues a slot can sit on. A slot is on at most one at a time;
/// the running process is on none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueId {
    Free,
    Ready,
}

/// Intrusive queue node carried by every PCB: neighbour slot indices plus
/// the queue the slot currently belongs to. Knowing the queue makes removal
/// O(1) from anywhere without consulting the queue headers first.
#[derive(Debug, Clone, Copy)]
pub struct QueueLink {
    pub prev: Option<usize>,
    pub next: Option<usize>,
    pub on: Option<QueueId>,
}

impl QueueLink {
    pub const fn detached() -> Self {
        QueueLink { prev: None, next: None, on: None }
    }
}

/// Queue header. The nodes live inside the PCBs; only head, tail and the
/// length are kept here.
#[derive(Debug, Clone, Copy)]
pub struct TaskQueue {
    pub head: Option<usize>,
    pub tail: Option<usize>,
    pub len: usize,
}

impl TaskQueue {
    pub const fn new() -> Self {
        TaskQueue { head: None, tail: None, len: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Process control block. Padded to 16 bytes so the stack that follows it
/// in a slot starts and ends on a 16-byte boundary.
#[derive(Debug, Clone, Copy)]
#[repr(align(16))]
pub struct Process {
    pub pid: ProcessId,
    /// Physical address of the page directory loaded into CR3.
    pub page_dir: u64,
    /// Configured time-slice length for this process.
    pub quantum: u64,
    pub state: ProcessState,
    pub stats: Stats,
    pub link: QueueLink,
    /// Saved callee-preserved registers, including the kernel stack pointer
    /// this slot resumes on.
    pub context: Context,
    /// Last recorded accounting transition, checked against the legal cycle
    /// in debug builds.
    pub(super) last_trans: Option<Transition>,
}

impl Process {
    pub const fn unused() -> Self {
        Process {
            pid: ProcessId(-1),
            page_dir: 0,
            quantum: DEFAULT_QUANTUM,
            state: ProcessState::Free,
            stats: Stats::zeroed(),
            link: QueueLink::detached(),
            context: Context::empty(),
            last_trans: None,
        }
    }
}

/// One task slot: the PCB at the base of the region and the kernel stack
/// filling the rest, so the stack top coincides with the end of the slot.
/// `Copy` lets fork duplicate a whole slot (trap frame included) in a
/// single assignment.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct TaskSlot {
    pub process: Process,
    pub stack: [u64; KERNEL_STACK_SIZE],
}

impl TaskSlot {
    pub const EMPTY: TaskSlot = TaskSlot {
        process: Process::unused(),
        stack: [0; KERNEL_STACK_SIZE],
    };

    /// Address one past the last stack word; where the CPU lands on a ring
    /// 3 → ring 0 crossing into this slot.
    pub fn stack_top(&self) -> u64 {
        self.stack.as_ptr() as u64 + (KERNEL_STACK_SIZE * 8) as u64
    }
}
