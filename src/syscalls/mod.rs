pub mod errno;

use errno::Errno;

use crate::memory::user;
use crate::scheduler::stats::{Stats, Transition};
use crate::scheduler::{self, with_sched};

/// Syscall numbers (passed in RAX from userland). The table is sparse;
/// every unlisted entry is the reserved no-op.
pub const SYS_EXIT: u64 = 1;
pub const SYS_FORK: u64 = 2;
pub const SYS_WRITE: u64 = 4;
pub const SYS_GETTIME: u64 = 10;
pub const SYS_GETPID: u64 = 20;
pub const SYS_GET_STATS: u64 = 35;

/// `sys_write` stages user bytes through this much kernel stack at a time.
const WRITE_CHUNK: usize = 256;

type SyscallResult = Result<isize, Errno>;

/// Central dispatcher, called from the `int 0x80` trampoline.
/// Arguments arrive in registers: RAX = number, RDI/RSI/RDX = args; the
/// result goes back in RAX, negative values carrying a negated errno.
///
/// Every syscall is bracketed by the two accounting transitions here, on
/// every exit path. The two asymmetries are deliberate: `sys_exit` never
/// comes back to close its bracket, and a fork child closes its own in
/// `ret_from_fork` on the way out.
pub extern "C" fn dispatch(number: u64, arg0: u64, arg1: u64, arg2: u64) -> isize {
    // The gate cleared IF; let the timer keep counting while we work.
    x86_64::instructions::interrupts::enable();
    with_sched(|sched| sched.update_stats_current(Transition::UserToSys));

    let result = match number {
        SYS_EXIT => scheduler::exit_current(),
        SYS_FORK => sys_fork(),
        SYS_WRITE => sys_write(arg0 as i32, arg1, arg2 as i64),
        SYS_GETTIME => sys_gettime(),
        SYS_GETPID => sys_getpid(),
        SYS_GET_STATS => sys_get_stats(arg0 as i32, arg1),
        _ => sys_ni_syscall(),
    };

    with_sched(|sched| sched.update_stats_current(Transition::SysToUser));
    match result {
        Ok(value) => value,
        Err(err) => err.as_neg(),
    }
}

/// The console is the only file, at fd 1.
fn check_fd(fd: i32) -> Result<(), Errno> {
    if fd != 1 {
        return Err(Errno::BadF);
    }
    Ok(())
}

/// Reserved table entries land here.
fn sys_ni_syscall() -> SyscallResult {
    Err(Errno::NoSys)
}

fn sys_fork() -> SyscallResult {
    with_sched(|sched| {
        let mut spaces = crate::memory::paging::USER_SPACES.lock();
        let mut frames = crate::memory::FRAME_ALLOCATOR.lock();
        sched.sys_fork(&mut spaces, &mut frames)
    })
}

fn sys_write(fd: i32, buf: u64, size: i64) -> SyscallResult {
    check_fd(fd)?;
    if buf == 0 {
        return Err(Errno::Fault);
    }
    if size < 0 {
        return Err(Errno::Inval);
    }
    let size = size as usize;
    if !user::access_ok(buf, size) {
        return Err(Errno::Fault);
    }

    // Stage through a kernel buffer; the console driver never sees user
    // memory. The copy walks the caller's page table, so a range-valid
    // buffer over unmapped pages still faults here.
    let slot = with_sched(|sched| sched.current_slot());
    let spaces = crate::memory::paging::USER_SPACES.lock();
    let pt = spaces.user_table(slot);
    let mut chunk = [0u8; WRITE_CHUNK];
    let mut done = 0;
    while done < size {
        let n = WRITE_CHUNK.min(size - done);
        user::copy_from_user(pt, buf + done as u64, &mut chunk[..n]).map_err(|_| Errno::Fault)?;
        crate::drivers::console::write_to_console(&chunk[..n]);
        done += n;
    }
    Ok(size as isize)
}

fn sys_gettime() -> SyscallResult {
    with_sched(|sched| Ok(sched.ticks() as isize))
}

fn sys_getpid() -> SyscallResult {
    with_sched(|sched| Ok(sched.current().pid.0 as isize))
}

fn sys_get_stats(pid: i32, out: u64) -> SyscallResult {
    if pid < 0 {
        return Err(Errno::Inval);
    }
    if !user::access_ok(out, core::mem::size_of::<Stats>()) {
        return Err(Errno::Fault);
    }
    let (found, slot) = with_sched(|sched| {
        (
            sched.find_by_pid(pid).map(|s| sched.process(s).stats),
            sched.current_slot(),
        )
    });
    let stats = found.ok_or(Errno::Srch)?;
    // The range already validated, so a copy that still fails means the
    // destination pages are absent or read-only (the shared code region):
    // a permission problem, not an addressing one.
    let spaces = crate::memory::paging::USER_SPACES.lock();
    user::copy_to_user(&stats, spaces.user_table(slot), out).map_err(|_| Errno::Perm)?;
    Ok(0)
}

pub fn init() {
    crate::log_info!("Syscall interface initialized.");
}
