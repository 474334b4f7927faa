use core::arch::naked_asm;

/// Callee-preserved register image saved across a context switch, in the
/// System V x86_64 ABI. This is the single definition of the save layout:
/// `switch_context`, `restore_context` and the fabricated fork-child image
/// all derive from it (the assembly offsets are pinned by tests below).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl Context {
    pub const fn empty() -> Self {
        Context { rsp: 0, rbp: 0, rbx: 0, r12: 0, r13: 0, r14: 0, r15: 0, rip: 0 }
    }

    /// Image that makes the first switch into a slot begin execution at
    /// `entry` on a fresh stack. Keeps the System V rule that RSP is
    /// 8-off-16 at a function's first instruction.
    pub fn starting_at(entry: u64, stack_top: u64) -> Self {
        let rsp = (stack_top & !0xF) - 8;
        Context { rsp, rip: entry, ..Context::empty() }
    }

    /// Image that makes the first switch into a fork child resume at the
    /// trampoline with RSP already on the inherited trap frame.
    pub fn resuming_trap_frame(trap_frame_base: u64) -> Self {
        Context {
            rsp: trap_frame_base,
            rip: fork_trampoline as usize as u64,
            ..Context::empty()
        }
    }
}

/// Suspend the current flow into `old` and resume `new`.
/// The register set stored here must stay in lockstep with the `Context`
/// field order; `restore_context` and `fork_trampoline` rely on it too.
///
/// # Safety
/// Both pointers must refer to live `Context` values whose stack words stay
/// valid until the contexts are resumed.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old: *mut Context, new: *const Context) {
    naked_asm!(
        // rdi = old: park the callee-saved set and a resume address.
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        // rsi = new: adopt its stack and registers, then jump.
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "jmp [rsi + 0x38]",
        // Resumption point for `old`, reached on some later switch.
        "2:",
        "ret",
    );
}

/// Resume `new` without saving the current flow. Used when the outgoing
/// process is gone (exit) and at the boot handoff.
///
/// # Safety
/// Same requirements as `switch_context` for `new`; the current stack is
/// abandoned for good.
#[unsafe(naked)]
pub unsafe extern "C" fn restore_context(new: *const Context) -> ! {
    naked_asm!(
        "mov rsp, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x20]",
        "mov r14, [rdi + 0x28]",
        "mov r15, [rdi + 0x30]",
        "jmp [rdi + 0x38]",
    );
}

/// Register image the `int 0x80` entry pushes on the slot's kernel stack,
/// low address first, ending with the five words the CPU pushed itself.
/// It always sits at the top of the slot, so its base is `stack_top`
/// minus `TRAP_FRAME_SIZE`.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct TrapFrame {
    pub rcx: u64,
    pub rbx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Bytes between a slot's stack top and the base of its trap frame.
pub const TRAP_FRAME_SIZE: usize = core::mem::size_of::<TrapFrame>();

/// First instruction a fork child ever executes: report the transition back
/// to ring 3 and produce the child's return value.
extern "C" fn ret_from_fork() -> i64 {
    super::fork_child_return();
    0
}

/// Entered by the first `switch_context` into a fork child, with RSP on the
/// trap frame inherited from the parent. `ret_from_fork` leaves 0 in RAX;
/// unwinding the trap frame then lands in user mode right after the `int
/// 0x80` that forked, so the child observes `fork() == 0`. The pops mirror
/// the pushes in the syscall entry and deliberately skip RAX.
#[unsafe(naked)]
pub extern "C" fn fork_trampoline() {
    naked_asm!(
        "sub rsp, 8",
        "call {ret_from_fork}",
        "add rsp, 8",
        "pop rcx",
        "pop rbx",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "iretq",
        ret_from_fork = sym ret_from_fork,
    );
}
