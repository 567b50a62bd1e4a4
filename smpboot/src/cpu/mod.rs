// SPDX-License-Identifier: MPL-2.0

//! CPU-related definitions.

pub mod local;

use spin::Once;

/// The ID of a CPU in the system.
///
/// The bootstrap processor is always CPU 0; application processors take
/// the IDs from 1 up to `num_cpus() - 1`, in the order in which they win
/// the race on the shared ID counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuId(u32);

impl CpuId {
    /// Returns the CPU ID of the bootstrap processor (BSP).
    pub const fn bsp() -> Self {
        CpuId(0)
    }

    /// Converts the CPU ID to an `usize`.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<usize> for CpuId {
    type Error = &'static str;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        if value < num_cpus() {
            Ok(CpuId(value as u32))
        } else {
            Err("The given CPU ID is out of range")
        }
    }
}

/// The number of CPUs.
static NUM_CPUS: Once<u32> = Once::new();

/// Initializes the number of CPUs.
///
/// # Safety
///
/// The caller must ensure that this function is called only once on the
/// BSP, with the number of all processors that may run.
pub(crate) unsafe fn init_num_cpus(num_cpus: u32) {
    assert!(num_cpus >= 1);
    NUM_CPUS.call_once(|| num_cpus);
}

/// Returns the number of CPUs.
pub fn num_cpus() -> usize {
    debug_assert!(
        NUM_CPUS.get().is_some(),
        "The number of CPUs is not initialized"
    );
    // SAFETY: The number of CPUs is initialized. The unsafe version is
    // used to avoid the overhead of the check.
    let num = unsafe { *NUM_CPUS.get_unchecked() };
    num as usize
}

/// Returns an iterator over all CPUs.
pub fn all_cpus() -> impl Iterator<Item = CpuId> {
    (0..num_cpus()).map(|id| CpuId(id as u32))
}

/// Records the ID of the current CPU in its CPU-local storage.
///
/// # Safety
///
/// The caller must ensure that this function is called only once on each
/// processor, with that processor's allocated ID, after its CPU-local base
/// is installed.
pub(crate) unsafe fn set_this_cpu_id(id: u32) {
    local::is_used::debug_set_true();
    crate::arch::cpu::local::current_cpu_id::set(id);
}

/// Returns the ID of the CPU this code runs on.
///
/// There is no scheduler during bring-up, so execution cannot migrate
/// between processors and the returned ID is stable.
pub fn this_cpu_id() -> CpuId {
    let id = crate::arch::cpu::local::current_cpu_id::get();
    debug_assert_ne!(id, u32::MAX, "This CPU is not initialized");
    CpuId(id)
}
