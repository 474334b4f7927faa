//! Per-process time accounting.
//!
//! Every ring crossing and every scheduling decision is one of four
//! transitions; each records the ticks spent in the state being left.
//! Bracketing each syscall with `UserToSys`/`SysToUser` gives exact
//! accounting without instrumenting individual syscalls.

/// The four accounting transitions, forming the cycle
/// user → system → {user, ready} → system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Ring 3 entered the kernel (syscall or timer interrupt).
    UserToSys,
    /// The kernel returned to ring 3.
    SysToUser,
    /// The running process was moved to the ready queue.
    SysToReady,
    /// A ready process was handed the CPU.
    ReadyToSys,
}

impl Transition {
    /// Legal successors. `None` is the just-created state: the first thing a
    /// process experiences is being scheduled in (fork child) or its first
    /// kernel entry (the boot-time init task).
    pub fn may_follow(self, prev: Option<Transition>) -> bool {
        use Transition::*;
        match prev {
            None => matches!(self, UserToSys | ReadyToSys),
            Some(UserToSys) | Some(ReadyToSys) => matches!(self, SysToUser | SysToReady),
            Some(SysToUser) => matches!(self, UserToSys),
            Some(SysToReady) => matches!(self, ReadyToSys),
        }
    }

    fn index(self) -> usize {
        match self {
            Transition::UserToSys => 0,
            Transition::SysToUser => 1,
            Transition::SysToReady => 2,
            Transition::ReadyToSys => 3,
        }
    }
}

/// The accounting record, in timer ticks. `repr(C)` because `sys_get_stats`
/// copies it verbatim to user memory.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub user_ticks: u64,
    pub system_ticks: u64,
    pub ready_ticks: u64,
    pub elapsed_total_ticks: u64,
    /// One counter per transition, indexed in declaration order.
    pub total_trans: [u64; 4],
    /// Snapshot of the remaining time slice, taken when the process last
    /// left the CPU for the ready queue.
    pub remaining_ticks: u64,
    pub last_event_tick: u64,
}

impl Stats {
    pub const fn zeroed() -> Self {
        Stats {
            user_ticks: 0,
            system_ticks: 0,
            ready_ticks: 0,
            elapsed_total_ticks: 0,
            total_trans: [0; 4],
            remaining_ticks: 0,
            last_event_tick: 0,
        }
    }

    /// Reset the record for a fresh process, stamping creation time.
    pub fn init(&mut self, now: u64) {
        *self = Stats::zeroed();
        self.last_event_tick = now;
    }

    /// Charge the ticks since the previous event to the state this
    /// transition leaves, and restamp. `slice_left` is only consulted for
    /// the `SysToReady` snapshot.
    pub fn record(&mut self, trans: Transition, now: u64, slice_left: u64) {
        let delta = now - self.last_event_tick;
        match trans {
            Transition::UserToSys => self.user_ticks += delta,
            Transition::SysToUser | Transition::SysToReady => self.system_ticks += delta,
            Transition::ReadyToSys => self.ready_ticks += delta,
        }
        self.elapsed_total_ticks += delta;
        self.total_trans[trans.index()] += 1;
        self.last_event_tick = now;
        if trans == Transition::SysToReady {
            self.remaining_ticks = slice_left;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_bracket_without_a_tick_is_free() {
        let mut st = Stats::zeroed();
        st.init(7);
        st.record(Transition::UserToSys, 7, 0);
        st.record(Transition::SysToUser, 7, 0);
        assert_eq!(st.system_ticks, 0);
        assert_eq!(st.user_ticks, 0);
        assert_eq!(st.total_trans, [1, 1, 0, 0]);
    }

    #[test]
    fn deltas_land_in_the_state_left() {
        let mut st = Stats::zeroed();
        st.init(0);
        st.record(Transition::UserToSys, 4, 0); // 4 ticks of user time
        st.record(Transition::SysToReady, 6, 9); // 2 ticks of system time
        st.record(Transition::ReadyToSys, 11, 0); // 5 ticks waiting
        st.record(Transition::SysToUser, 11, 0);
        assert_eq!(st.user_ticks, 4);
        assert_eq!(st.system_ticks, 2);
        assert_eq!(st.ready_ticks, 5);
        assert_eq!(st.elapsed_total_ticks, 11);
        assert_eq!(st.remaining_ticks, 9);
    }

    #[test]
    fn buckets_never_exceed_elapsed() {
        let mut st = Stats::zeroed();
        st.init(3);
        let script = [
            (Transition::UserToSys, 5),
            (Transition::SysToUser, 5),
            (Transition::UserToSys, 9),
            (Transition::SysToReady, 10),
            (Transition::ReadyToSys, 30),
            (Transition::SysToUser, 31),
        ];
        for (trans, now) in script {
            st.record(trans, now, 0);
        }
        let accounted = st.user_ticks + st.system_ticks + st.ready_ticks;
        assert_eq!(accounted, st.elapsed_total_ticks);
    }

    #[test]
    fn transition_cycle_is_enforced() {
        use Transition::*;
        assert!(UserToSys.may_follow(None));
        assert!(ReadyToSys.may_follow(None));
        assert!(!SysToUser.may_follow(None));
        assert!(SysToReady.may_follow(Some(UserToSys)));
        assert!(SysToUser.may_follow(Some(ReadyToSys)));
        assert!(!UserToSys.may_follow(Some(UserToSys)));
        assert!(ReadyToSys.may_follow(Some(SysToReady)));
        assert!(!SysToUser.may_follow(Some(SysToReady)));
        assert!(UserToSys.may_follow(Some(SysToUser)));
    }
}
