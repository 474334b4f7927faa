pub mod context;
pub mod stats;
pub mod task;

use spin::Mutex;

use context::{restore_context, switch_context, Context, TRAP_FRAME_SIZE};
use stats::Transition;
use task::{
    Process, ProcessId, ProcessState, QueueId, QueueLink, TaskQueue, TaskSlot, DEFAULT_QUANTUM,
    IDLE, INIT, NR_TASKS,
};

use crate::memory::frame_allocator::BitmapFrameAllocator;
use crate::memory::paging::UserSpaces;
use crate::syscalls::errno::Errno;

/// All process-wide scheduler state in one place: the task pool (each slot
/// holding a PCB and its kernel stack), both intrusive queues, the running
/// slot, the tick and PID counters and the running slice. Mutated only in
/// kernel mode; on this uniprocessor the lock plus interrupt masking is the
/// whole mutual-exclusion story.
pub struct Sched {
    tasks: [TaskSlot; NR_TASKS],
    freequeue: TaskQueue,
    readyqueue: TaskQueue,
    /// Slot owning the CPU. Rewritten by `sched_next_rr`; this is the one
    /// authoritative `current()`.
    current: usize,
    /// Ticks left in the running process's slice.
    ticks_left: u64,
    /// Monotonic timer tick counter.
    ticks: u64,
    /// Next PID to hand out; 0 and 1 went to the boot processes.
    next_pid: i32,
}

pub static SCHED: Mutex<Sched> = Mutex::new(Sched::new());

/// Run `f` with the scheduler locked and the timer held off. Every lock
/// acquisition outside the interrupt handler goes through here, so a tick
/// can never spin on a lock its own CPU already holds.
pub fn with_sched<R>(f: impl FnOnce(&mut Sched) -> R) -> R {
    #[cfg(not(test))]
    return x86_64::instructions::interrupts::without_interrupts(|| f(&mut SCHED.lock()));
    // Host tests have no interrupt flag to mask.
    #[cfg(test)]
    f(&mut SCHED.lock())
}

/// Everything the low-level switch needs after the scheduler lock is
/// dropped. Slot memory is statically allocated, so the context pointers
/// taken under the lock stay valid.
pub struct Switch {
    prev_context: *mut Context,
    next_context: *const Context,
    next_dir: u64,
    next_rsp0: u64,
}

impl Sched {
    pub const fn new() -> Self {
        Sched {
            tasks: [TaskSlot::EMPTY; NR_TASKS],
            freequeue: TaskQueue::new(),
            readyqueue: TaskQueue::new(),
            current: INIT,
            ticks_left: DEFAULT_QUANTUM,
            ticks: 0,
            next_pid: 2,
        }
    }

    // ── boot ──────────────────────────────────────────────────────────

    /// Bring up the pool: free queue over slots 2.., empty ready queue,
    /// the idle task in slot 0 and the init task running in slot 1.
    pub fn init(&mut self, spaces: &mut UserSpaces) {
        self.init_freequeue();
        self.init_readyqueue();
        self.init_idle(spaces);
        self.init_task1(spaces);
    }

    fn init_freequeue(&mut self) {
        for slot in INIT + 1..NR_TASKS {
            self.tasks[slot].process = Process::unused();
            self.enqueue(QueueId::Free, slot);
        }
    }

    fn init_readyqueue(&mut self) {
        self.readyqueue = TaskQueue::new();
    }

    fn init_idle(&mut self, spaces: &mut UserSpaces) {
        let dir = spaces.allocate_dir(IDLE);
        let now = self.ticks;
        let stack_top = self.tasks[IDLE].stack_top();
        let idle = &mut self.tasks[IDLE].process;
        idle.pid = ProcessId(0);
        idle.page_dir = dir;
        idle.quantum = DEFAULT_QUANTUM;
        // Runnable but never on the ready queue; picked only when that
        // queue is empty.
        idle.state = ProcessState::Ready;
        idle.link = QueueLink::detached();
        idle.stats.init(now);
        idle.last_trans = None;
        // The first switch into this slot lands straight in the halt loop.
        idle.context = Context::starting_at(cpu_idle as usize as u64, stack_top);
    }

    fn init_task1(&mut self, spaces: &mut UserSpaces) {
        let dir = spaces.allocate_dir(INIT);
        let now = self.ticks;
        let init = &mut self.tasks[INIT].process;
        init.pid = ProcessId(1);
        init.page_dir = dir;
        init.quantum = DEFAULT_QUANTUM;
        init.state = ProcessState::Run;
        init.link = QueueLink::detached();
        init.stats.init(now);
        init.last_trans = None;
        // Its context is garbage until the first switch away fills it.
        init.context = Context::empty();
    }

    // ── accessors ─────────────────────────────────────────────────────

    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// The PCB owning the CPU right now.
    pub fn current(&self) -> &Process {
        &self.tasks[self.current].process
    }

    pub fn process(&self, slot: usize) -> &Process {
        &self.tasks[slot].process
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn advance_tick(&mut self) {
        self.ticks += 1;
    }

    pub fn free_len(&self) -> usize {
        self.freequeue.len
    }

    pub fn ready_len(&self) -> usize {
        self.readyqueue.len
    }

    pub fn get_quantum(&self, slot: usize) -> u64 {
        self.tasks[slot].process.quantum
    }

    pub fn set_quantum(&mut self, slot: usize, quantum: u64) {
        self.tasks[slot].process.quantum = quantum;
    }

    /// Linear PID lookup over the pool, skipping dead slots. Fine at this
    /// pool size; PIDs of reaped processes are never reissued.
    pub fn find_by_pid(&self, pid: i32) -> Option<usize> {
        (0..NR_TASKS).find(|&slot| {
            let proc = &self.tasks[slot].process;
            proc.state != ProcessState::Free && proc.pid.0 == pid
        })
    }

    // ── accounting ────────────────────────────────────────────────────

    /// Record a transition for the running process.
    pub fn update_stats_current(&mut self, trans: Transition) {
        self.update_stats(self.current, trans);
    }

    fn update_stats(&mut self, slot: usize, trans: Transition) {
        let now = self.ticks;
        let slice_left = self.ticks_left;
        let proc = &mut self.tasks[slot].process;
        debug_assert!(
            trans.may_follow(proc.last_trans),
            "transition {:?} after {:?} breaks the accounting cycle",
            trans,
            proc.last_trans,
        );
        proc.last_trans = Some(trans);
        proc.stats.record(trans, now, slice_left);
    }

    // ── queues ────────────────────────────────────────────────────────

    fn queue(&self, queue: QueueId) -> &TaskQueue {
        match queue {
            QueueId::Free => &self.freequeue,
            QueueId::Ready => &self.readyqueue,
        }
    }

    fn queue_mut(&mut self, queue: QueueId) -> &mut TaskQueue {
        match queue {
            QueueId::Free => &mut self.freequeue,
            QueueId::Ready => &mut self.readyqueue,
        }
    }

    fn enqueue(&mut self, queue: QueueId, slot: usize) {
        debug_assert!(self.tasks[slot].process.link.on.is_none());
        debug_assert!(matches!(
            (queue, self.tasks[slot].process.state),
            (QueueId::Free, ProcessState::Free) | (QueueId::Ready, ProcessState::Ready)
        ));
        let tail = self.queue(queue).tail;
        self.tasks[slot].process.link = QueueLink { prev: tail, next: None, on: Some(queue) };
        match tail {
            Some(prev_tail) => self.tasks[prev_tail].process.link.next = Some(slot),
            None => self.queue_mut(queue).head = Some(slot),
        }
        let header = self.queue_mut(queue);
        header.tail = Some(slot);
        header.len += 1;
    }

    fn dequeue_head(&mut self, queue: QueueId) -> Option<usize> {
        let head = self.queue(queue).head?;
        self.unlink(head);
        Some(head)
    }

    /// Take a slot off whichever queue it is on; no-op when detached.
    fn unlink(&mut self, slot: usize) {
        let link = self.tasks[slot].process.link;
        let Some(queue) = link.on else { return };
        match link.prev {
            Some(prev) => self.tasks[prev].process.link.next = link.next,
            None => self.queue_mut(queue).head = link.next,
        }
        match link.next {
            Some(next) => self.tasks[next].process.link.prev = link.prev,
            None => self.queue_mut(queue).tail = link.prev,
        }
        self.queue_mut(queue).len -= 1;
        self.tasks[slot].process.link = QueueLink::detached();
    }

    // ── round-robin policy ────────────────────────────────────────────

    /// Per-tick bookkeeping: burn one tick of the running slice.
    pub fn update_sched_data_rr(&mut self) {
        self.ticks_left = self.ticks_left.saturating_sub(1);
    }

    /// Whether the running process must yield the CPU: slice exhausted and
    /// somebody is waiting. An exhausted slice with an empty ready queue
    /// just recharges in place.
    pub fn needs_sched_rr(&mut self) -> bool {
        if self.ticks_left > 0 {
            return false;
        }
        if self.readyqueue.is_empty() {
            self.ticks_left = self.tasks[self.current].process.quantum;
            return false;
        }
        true
    }

    /// Detach the running process and file it on `dst`: READY at the ready
    /// queue's tail (the idle task only changes state, per its invariant),
    /// FREE on the free queue. `None` leaves it running and queueless.
    pub fn update_current_state_rr(&mut self, dst: Option<QueueId>) {
        let cur = self.current;
        self.unlink(cur);
        let Some(queue) = dst else { return };
        match queue {
            QueueId::Ready => {
                self.update_stats(cur, Transition::SysToReady);
                self.tasks[cur].process.state = ProcessState::Ready;
                if cur != IDLE {
                    self.enqueue(QueueId::Ready, cur);
                }
            }
            QueueId::Free => {
                self.tasks[cur].process.state = ProcessState::Free;
                self.enqueue(QueueId::Free, cur);
            }
        }
    }

    /// Pick the successor — ready-queue head, or the idle task when the
    /// queue is empty — mark it running with a fresh slice and plan the
    /// switch. Returns `None` when the successor already owns the CPU.
    pub fn sched_next_rr(&mut self) -> Option<Switch> {
        let prev = self.current;
        let next = self.dequeue_head(QueueId::Ready).unwrap_or(IDLE);
        self.update_stats(next, Transition::ReadyToSys);
        self.tasks[next].process.state = ProcessState::Run;
        self.ticks_left = self.tasks[next].process.quantum;
        if next == prev {
            return None;
        }
        self.current = next;
        Some(Switch {
            prev_context: &mut self.tasks[prev].process.context as *mut Context,
            next_context: &self.tasks[next].process.context as *const Context,
            next_dir: self.tasks[next].process.page_dir,
            next_rsp0: self.tasks[next].stack_top(),
        })
    }

    // ── process lifecycle ─────────────────────────────────────────────

    /// Create a child of the running process: pull a slot off the free
    /// queue, duplicate the parent's slot and user window, fabricate the
    /// child's return and file it at the ready queue's tail. The parent
    /// gets the child PID; the child will observe 0.
    pub fn sys_fork(
        &mut self,
        spaces: &mut UserSpaces,
        frames: &mut BitmapFrameAllocator,
    ) -> Result<isize, Errno> {
        let parent = self.current;
        let Some(child) = self.dequeue_head(QueueId::Free) else {
            return Err(Errno::Again);
        };

        // The child inherits the parent's whole slot, kernel stack
        // included: the trap frame pushed on syscall entry rides along at
        // its fixed offset below the stack top.
        self.tasks[child] = self.tasks[parent];

        let dir = spaces.allocate_dir(child);
        if spaces.clone_user(parent, child, frames).is_err() {
            // Reserved frames were already rolled back; hand the slot back.
            let proc = &mut self.tasks[child].process;
            proc.state = ProcessState::Free;
            proc.link = QueueLink::detached();
            self.enqueue(QueueId::Free, child);
            return Err(Errno::NoMem);
        }

        let pid = self.assign_pid();
        let now = self.ticks;
        let trap_frame_base = self.tasks[child].stack_top() - TRAP_FRAME_SIZE as u64;
        let proc = &mut self.tasks[child].process;
        proc.pid = pid;
        proc.page_dir = dir;
        proc.link = QueueLink::detached();
        proc.stats.init(now);
        proc.last_trans = None;
        // First switch into the child resumes at the trampoline, which
        // unwinds the inherited trap frame with RAX = 0.
        proc.context = Context::resuming_trap_frame(trap_frame_base);
        proc.state = ProcessState::Ready;
        self.enqueue(QueueId::Ready, child);
        Ok(pid.0 as isize)
    }

    fn assign_pid(&mut self) -> ProcessId {
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Tear down the running process: user frames back to the allocator,
    /// slot onto the free queue, CPU to the next runnable process.
    pub fn sys_exit(
        &mut self,
        spaces: &mut UserSpaces,
        frames: &mut BitmapFrameAllocator,
    ) -> Switch {
        let cur = self.current;
        spaces.free_user_pages(cur, frames);
        self.update_current_state_rr(Some(QueueId::Free));
        self.sched_next_rr()
            .expect("exit must hand the CPU to some successor")
    }
}

// ── kernel-side entry points ──────────────────────────────────────────

/// Boot-time bring-up: queues, idle task, init task, and the init task's
/// user program image.
pub fn init_sched() {
    with_sched(|sched| {
        let mut spaces = crate::memory::paging::USER_SPACES.lock();
        let mut frames = crate::memory::FRAME_ALLOCATOR.lock();
        sched.init(&mut spaces);
        spaces
            .init_user_program(INIT, &mut frames)
            .expect("not enough frames to map the init task");
    });
    crate::log_info!("Scheduler initialized: init task runnable, idle task standing by.");
}

/// Timer-tick entry, run by the interrupt handler with interrupts masked.
/// `from_user` says whether ring 3 was interrupted: that is the only point
/// where an expired quantum turns into a context switch, and the only tick
/// that crosses the accounting boundary. In-kernel ticks just advance the
/// clock and burn the slice; kernel code runs to completion.
pub fn clock_routine(from_user: bool) {
    let plan = {
        let mut sched = SCHED.lock();
        sched.advance_tick();
        if !from_user {
            sched.update_sched_data_rr();
            None
        } else {
            sched.update_stats_current(Transition::UserToSys);
            sched.update_sched_data_rr();
            if sched.needs_sched_rr() {
                sched.update_current_state_rr(Some(QueueId::Ready));
                sched.sched_next_rr()
            } else {
                None
            }
        }
    };
    if let Some(switch) = plan {
        unsafe { task_switch(switch) };
    }
    if from_user {
        // Reached at once when nobody took the CPU, or much later when it
        // comes back: either way this task is about to iretq into ring 3.
        SCHED.lock().update_stats_current(Transition::SysToUser);
    }
}

/// Terminate the running process. Interrupts stay off from here: the
/// handoff never returns to this stack.
pub fn exit_current() -> ! {
    x86_64::instructions::interrupts::disable();
    let switch = {
        let mut sched = SCHED.lock();
        let mut spaces = crate::memory::paging::USER_SPACES.lock();
        let mut frames = crate::memory::FRAME_ALLOCATOR.lock();
        sched.sys_exit(&mut spaces, &mut frames)
    };
    unsafe { task_handoff(switch) }
}

/// First kernel-side step of a fork child, called by the trampoline before
/// it unwinds to ring 3: close the accounting bracket the parent's
/// dispatcher opened.
pub(crate) fn fork_child_return() {
    SCHED.lock().update_stats_current(Transition::SysToUser);
}

/// Hand the CPU to the init task's user code. The boot stack is abandoned;
/// every later kernel entry runs on the owning slot's stack.
pub fn start_init_task() -> ! {
    let (dir, rsp0) = with_sched(|sched| {
        (sched.tasks[INIT].process.page_dir, sched.tasks[INIT].stack_top())
    });
    crate::interrupts::gdt::set_tss_rsp0(rsp0);
    unsafe { crate::memory::paging::load_dir(dir) };
    crate::interrupts::usermode::jump_to_usermode(
        crate::memory::layout::USER_START,
        crate::memory::layout::USER_STACK_TOP,
    )
}

/// Apply a switch plan once the scheduler lock is dropped: pivot the TSS to
/// the incoming stack, activate the incoming directory (flushing the TLB)
/// and swap register files. Returns whenever the outgoing context gets the
/// CPU back.
///
/// # Safety
/// `switch` must come from `sched_next_rr` on the live scheduler, with the
/// lock since released.
unsafe fn task_switch(switch: Switch) {
    crate::interrupts::gdt::set_tss_rsp0(switch.next_rsp0);
    crate::memory::paging::load_dir(switch.next_dir);
    switch_context(switch.prev_context, switch.next_context);
}

/// One-way variant for exit and boot: the outgoing context is dead, so
/// nothing is saved.
unsafe fn task_handoff(switch: Switch) -> ! {
    crate::interrupts::gdt::set_tss_rsp0(switch.next_rsp0);
    crate::memory::paging::load_dir(switch.next_dir);
    restore_context(switch.next_context)
}

/// Body of PID 0: wait for interrupts forever. Runs only while the ready
/// queue is empty.
extern "C" fn cpu_idle() -> ! {
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::{NUM_PAG_CODE, NUM_PAG_DATA, PAGE_SIZE, PAG_LOG_INIT_CODE, PAG_LOG_INIT_DATA};
    use crate::memory::paging::mapped_frame;
    use x86_64::PhysAddr;

    fn boot(frame_count: usize) -> (Box<Sched>, Box<UserSpaces>, BitmapFrameAllocator) {
        let mut sched = Box::new(Sched::new());
        let mut spaces = Box::new(UserSpaces::new());
        let mut frames = BitmapFrameAllocator::new();
        let start = 0x40_0000u64;
        unsafe {
            frames.init(
                PhysAddr::new(start),
                PhysAddr::new(start + (frame_count * PAGE_SIZE) as u64),
            )
        };
        sched.init(&mut spaces);
        spaces.init_user_program(INIT, &mut frames).unwrap();
        (sched, spaces, frames)
    }

    fn queue_slots(sched: &Sched, queue: QueueId) -> Vec<usize> {
        let mut slots = Vec::new();
        let mut cursor = sched.queue(queue).head;
        while let Some(slot) = cursor {
            slots.push(slot);
            cursor = sched.tasks[slot].process.link.next;
        }
        slots
    }

    /// Invariants 1–4: the queues partition the pool, membership tags are
    /// coherent, queue states match, and the running slot is off-queue.
    fn assert_partition(sched: &Sched) {
        let free = queue_slots(sched, QueueId::Free);
        let ready = queue_slots(sched, QueueId::Ready);
        assert_eq!(free.len(), sched.freequeue.len);
        assert_eq!(ready.len(), sched.readyqueue.len);
        for slot in 0..NR_TASKS {
            let proc = &sched.tasks[slot].process;
            let on_free = free.contains(&slot);
            let on_ready = ready.contains(&slot);
            assert!(!(on_free && on_ready), "slot {slot} is on both queues");
            match proc.link.on {
                Some(QueueId::Free) => {
                    assert!(on_free);
                    assert_eq!(proc.state, ProcessState::Free);
                }
                Some(QueueId::Ready) => {
                    assert!(on_ready);
                    assert_eq!(proc.state, ProcessState::Ready);
                }
                None => assert!(!on_free && !on_ready),
            }
        }
        assert!(sched.tasks[sched.current].process.link.on.is_none());
        assert!(sched.tasks[IDLE].process.link.on != Some(QueueId::Ready));
    }

    /// One timer tick as the interrupt path runs it for a ring-3 tick.
    fn user_tick(sched: &mut Sched) {
        sched.advance_tick();
        sched.update_stats_current(Transition::UserToSys);
        sched.update_sched_data_rr();
        if sched.needs_sched_rr() {
            sched.update_current_state_rr(Some(QueueId::Ready));
            sched.sched_next_rr();
        }
        sched.update_stats_current(Transition::SysToUser);
    }

    #[test]
    fn boot_leaves_the_pool_in_the_documented_shape() {
        let (sched, _spaces, _frames) = boot(64);
        assert_eq!(queue_slots(&sched, QueueId::Free), vec![2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(sched.ready_len(), 0);
        assert_eq!(sched.current_slot(), INIT);
        assert_eq!(sched.current().pid, ProcessId(1));
        assert_eq!(sched.current().state, ProcessState::Run);
        assert_eq!(sched.tasks[IDLE].process.pid, ProcessId(0));
        assert!(sched.tasks[IDLE].process.link.on.is_none());
        assert_partition(&sched);
    }

    #[test]
    fn fork_creates_a_ready_child_with_the_next_pid() {
        let (mut sched, mut spaces, mut frames) = boot(64);
        let pid = sched.sys_fork(&mut spaces, &mut frames).unwrap();
        assert_eq!(pid, 2);
        assert_eq!(sched.free_len(), 7);
        assert_eq!(queue_slots(&sched, QueueId::Ready), vec![2]);
        assert_eq!(sched.current_slot(), INIT);

        let child = &sched.tasks[2].process;
        assert_eq!(child.state, ProcessState::Ready);
        assert_eq!(child.pid, ProcessId(2));
        assert_ne!(child.page_dir, sched.tasks[INIT].process.page_dir);
        assert_eq!(child.stats.elapsed_total_ticks, 0);
        // The fabricated return: resume on the inherited trap frame.
        assert_eq!(child.context.rsp, sched.tasks[2].stack_top() - TRAP_FRAME_SIZE as u64);
        assert_partition(&sched);
    }

    #[test]
    fn fork_shares_code_frames_and_copies_data_frames() {
        let (mut sched, mut spaces, mut frames) = boot(64);
        sched.sys_fork(&mut spaces, &mut frames).unwrap();
        for page in PAG_LOG_INIT_CODE..PAG_LOG_INIT_CODE + NUM_PAG_CODE {
            assert_eq!(
                mapped_frame(spaces.user_table(2), page),
                mapped_frame(spaces.user_table(INIT), page),
            );
        }
        for page in PAG_LOG_INIT_DATA..PAG_LOG_INIT_DATA + NUM_PAG_DATA {
            let parent = mapped_frame(spaces.user_table(INIT), page).unwrap();
            let child = mapped_frame(spaces.user_table(2), page).unwrap();
            assert_ne!(parent, child);
        }
    }

    #[test]
    fn fork_pids_increase_until_the_pool_runs_dry() {
        let (mut sched, mut spaces, mut frames) = boot(256);
        let mut last_pid = 1;
        for _ in 0..NR_TASKS - 2 {
            let pid = sched.sys_fork(&mut spaces, &mut frames).unwrap();
            assert!(pid > last_pid);
            last_pid = pid;
        }
        assert_eq!(sched.free_len(), 0);
        assert_eq!(sched.sys_fork(&mut spaces, &mut frames), Err(Errno::Again));
        assert_partition(&sched);
    }

    #[test]
    fn fork_under_memory_pressure_rolls_back_completely() {
        // Enough frames for the init task, but not for one more data copy.
        let (mut sched, mut spaces, mut frames) = boot(NUM_PAG_DATA + 10);
        let free_before = frames.free_frames();
        assert!(free_before < NUM_PAG_DATA);

        assert_eq!(sched.sys_fork(&mut spaces, &mut frames), Err(Errno::NoMem));

        assert_eq!(frames.free_frames(), free_before);
        assert_eq!(sched.free_len(), NR_TASKS - 2);
        assert_eq!(sched.ready_len(), 0);
        assert_eq!(sched.next_pid, 2, "no PID may be burned by a failed fork");
        assert_partition(&sched);
    }

    #[test]
    fn quantum_expiry_alternates_two_cpu_hogs() {
        let (mut sched, mut spaces, mut frames) = boot(64);
        sched.set_quantum(INIT, 3);
        let child = {
            sched.sys_fork(&mut spaces, &mut frames).unwrap();
            queue_slots(&sched, QueueId::Ready)[0]
        };
        assert_eq!(sched.get_quantum(child), 3, "the child inherits its parent's quantum");
        sched.ticks_left = 3;

        let mut schedule = Vec::new();
        for _ in 0..12 {
            schedule.push(sched.current_slot());
            user_tick(&mut sched);
        }
        assert_eq!(
            schedule,
            vec![INIT, INIT, INIT, child, child, child, INIT, INIT, INIT, child, child, child],
        );
        assert_partition(&sched);
    }

    #[test]
    fn expired_slice_with_nobody_waiting_recharges_in_place() {
        let (mut sched, _spaces, _frames) = boot(64);
        sched.ticks_left = 0;
        assert!(!sched.needs_sched_rr());
        assert_eq!(sched.ticks_left, sched.get_quantum(INIT));
        assert_eq!(sched.current_slot(), INIT);
    }

    #[test]
    fn exit_reclaims_the_slot_and_its_frames() {
        let (mut sched, mut spaces, mut frames) = boot(64);
        let child_pid = sched.sys_fork(&mut spaces, &mut frames).unwrap() as i32;
        let free_frames_before = frames.free_frames();

        // Rotate onto the child (a voluntary yield from the init task),
        // then let it exit.
        sched.update_stats_current(Transition::UserToSys);
        sched.update_current_state_rr(Some(QueueId::Ready));
        sched.sched_next_rr();
        assert_eq!(sched.current().pid.0, child_pid);
        sched.update_stats_current(Transition::SysToUser); // the fabricated fork return
        sched.update_stats_current(Transition::UserToSys); // the exit syscall's entry
        sched.sys_exit(&mut spaces, &mut frames);

        assert_eq!(sched.current_slot(), INIT);
        assert_eq!(sched.free_len(), NR_TASKS - 2);
        assert_eq!(frames.free_frames(), free_frames_before + NUM_PAG_DATA);
        assert_eq!(sched.find_by_pid(child_pid), None);
        // The dead PID is never reissued.
        let next = sched.sys_fork(&mut spaces, &mut frames).unwrap() as i32;
        assert!(next > child_pid);
        assert_partition(&sched);
    }

    #[test]
    fn exit_with_an_empty_ready_queue_hands_off_to_idle() {
        let (mut sched, mut spaces, mut frames) = boot(64);
        sched.update_stats_current(Transition::UserToSys);
        let switch = sched.sys_exit(&mut spaces, &mut frames);
        assert_eq!(sched.current_slot(), IDLE);
        assert_eq!(sched.tasks[IDLE].process.state, ProcessState::Run);
        assert_eq!(switch.next_rsp0, sched.tasks[IDLE].stack_top());
        assert!(sched.tasks[IDLE].process.link.on.is_none());
        assert_partition(&sched);
    }

    #[test]
    fn a_tick_inside_a_syscall_accrues_system_time() {
        let (mut sched, _spaces, _frames) = boot(64);
        sched.update_stats_current(Transition::UserToSys);
        sched.advance_tick();
        sched.update_stats_current(Transition::SysToUser);
        let stats = sched.process(sched.find_by_pid(1).unwrap()).stats;
        assert!(stats.system_ticks > 0);
        assert_eq!(stats.total_trans[0], 1);
        assert_eq!(stats.total_trans[1], 1);
    }

    #[test]
    fn preemption_snapshots_the_remaining_slice() {
        let (mut sched, mut spaces, mut frames) = boot(64);
        sched.set_quantum(INIT, 5);
        sched.sys_fork(&mut spaces, &mut frames).unwrap();
        sched.ticks_left = 5;
        // Preempt early through a voluntary rotation at 2 ticks burned.
        sched.advance_tick();
        sched.update_stats_current(Transition::UserToSys);
        sched.update_sched_data_rr();
        sched.advance_tick();
        sched.update_sched_data_rr();
        sched.update_current_state_rr(Some(QueueId::Ready));
        sched.sched_next_rr();
        assert_eq!(sched.tasks[INIT].process.stats.remaining_ticks, 3);
    }

    #[test]
    fn detaching_without_a_destination_keeps_current_running() {
        let (mut sched, _spaces, _frames) = boot(64);
        sched.update_current_state_rr(None);
        assert_eq!(sched.current_slot(), INIT);
        assert_eq!(sched.current().state, ProcessState::Run);
        assert_partition(&sched);
    }

    #[test]
    fn lookup_skips_free_slots() {
        let (sched, _spaces, _frames) = boot(64);
        assert_eq!(sched.find_by_pid(1), Some(INIT));
        assert_eq!(sched.find_by_pid(0), Some(IDLE));
        // Slot 2 is free; its stale PID field must not resolve.
        assert_eq!(sched.find_by_pid(sched.tasks[2].process.pid.0), None);
        assert_eq!(sched.find_by_pid(7), None);
    }
}
