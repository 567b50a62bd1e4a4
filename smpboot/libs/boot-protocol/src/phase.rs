// SPDX-License-Identifier: MPL-2.0

//! The mode-transition sequence of a booting application processor.
//!
//! Depending on the platform, a woken AP starts out in one of two reset
//! states: 16-bit unpaged execution (the classic INIT-SIPI-SIPI wake-up)
//! or long mode under firmware-owned page tables (mailbox-style wake-up).
//! Both are initial states of the same machine and converge once the
//! kernel's boot page table is active, while execution still runs at the
//! low identity-mapped addresses. One further transition — the jump to the
//! linked virtual addresses — completes the sequence.
//!
//! The machine here names the states and fixes the legal transitions; the
//! AP boot assembly carries one label per state. Keeping the two in sync
//! is what makes the transition logic auditable without a target machine.

/// One execution phase of a booting application processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    /// 16-bit unpaged execution, straight out of INIT/SIPI reset.
    RealMode16,
    /// The direct 64-bit reset state of mailbox-style wake-ups: long mode
    /// with firmware-owned page tables.
    LongModeReset,
    /// 32-bit protected mode, paging still disabled.
    ProtectedMode32,
    /// 64-bit paged execution under the kernel's boot page table, still at
    /// the low identity-mapped addresses.
    PagingEnabledLow,
    /// 64-bit paged execution at the linked virtual addresses; the phase
    /// in which control is handed off to the kernel entry point.
    Virtual,
    /// Parked for good. Entered only if the handoff target returns; there
    /// is no scheduler yet that could resume the processor meaningfully.
    Halted,
}

impl BootPhase {
    /// The two reset states an AP may be woken up in.
    pub const INITIAL: [BootPhase; 2] = [BootPhase::RealMode16, BootPhase::LongModeReset];

    /// The phase this phase transitions to, or `None` for the terminal
    /// [`BootPhase::Halted`].
    ///
    /// The `Virtual -> Halted` edge is only taken if the handoff target
    /// returns, which it must not.
    pub const fn successor(self) -> Option<BootPhase> {
        match self {
            BootPhase::RealMode16 => Some(BootPhase::ProtectedMode32),
            BootPhase::LongModeReset => Some(BootPhase::PagingEnabledLow),
            BootPhase::ProtectedMode32 => Some(BootPhase::PagingEnabledLow),
            BootPhase::PagingEnabledLow => Some(BootPhase::Virtual),
            BootPhase::Virtual => Some(BootPhase::Halted),
            BootPhase::Halted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_to_handoff(entry: BootPhase) -> Vec<BootPhase> {
        let mut path = vec![entry];
        while *path.last().unwrap() != BootPhase::Virtual {
            path.push(path.last().unwrap().successor().unwrap());
        }
        path
    }

    #[test]
    fn both_reset_states_reach_the_handoff_phase() {
        for entry in BootPhase::INITIAL {
            let path = run_to_handoff(entry);
            assert_eq!(*path.last().unwrap(), BootPhase::Virtual);
        }
    }

    #[test]
    fn reset_states_converge_before_paging_is_left_behind() {
        let real_mode = run_to_handoff(BootPhase::RealMode16);
        let long_mode = run_to_handoff(BootPhase::LongModeReset);
        assert!(real_mode.contains(&BootPhase::PagingEnabledLow));
        assert!(long_mode.contains(&BootPhase::PagingEnabledLow));
        // From the convergence point on, the two paths are identical.
        let tail_of = |path: &[BootPhase]| {
            let at = path
                .iter()
                .position(|p| *p == BootPhase::PagingEnabledLow)
                .unwrap();
            path[at..].to_vec()
        };
        assert_eq!(tail_of(&real_mode), tail_of(&long_mode));
    }

    #[test]
    fn halted_is_terminal() {
        assert_eq!(BootPhase::Halted.successor(), None);
    }
}
