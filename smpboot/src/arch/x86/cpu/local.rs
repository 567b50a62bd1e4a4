// SPDX-License-Identifier: MPL-2.0

//! Architecture dependent CPU-local information utilities.

use x86_64::registers::segmentation::{Segment64, FS};

/// Sets the base address for the CPU local storage by writing to the FS
/// base model-specific register. This operation is marked as `unsafe`
/// because it directly interfaces with low-level CPU registers.
///
/// # Safety
///
///  - This function is safe to call provided that the FS register is
///    dedicated entirely for CPU local storage and is not concurrently
///    accessed for other purposes.
///  - The caller must ensure that `addr` is a valid address and properly
///    aligned, as required by the CPU.
///  - This function should only be called in contexts where the CPU is in
///    a state to accept such changes, such as during processor
///    initialization.
pub(crate) unsafe fn set_base(addr: u64) {
    // SAFETY: The FS register is dedicated to CPU-local storage, as per
    // the caller's guarantee.
    unsafe {
        FS::write_base(x86_64::addr::VirtAddr::new(addr));
    }
}

/// Gets the base address for the CPU local storage by reading the FS base
/// model-specific register.
pub(crate) fn get_base() -> u64 {
    FS::read_base().as_u64()
}

pub(crate) mod current_cpu_id {
    //! The current CPU's ID lives at a fixed offset in the CPU-local
    //! storage and is read/written with single FS-relative instructions,
    //! so no lock is needed and no other CPU's copy can be touched.

    // The storage: one `u32` in the CPU-local image, `u32::MAX` until the
    // CPU records its ID. It is only ever addressed relative to the FS
    // base, so every CPU sees its own copy.
    core::arch::global_asm!(
        ".section .cpu_local, \"aw\"",
        ".balign 4",
        ".global __cpu_local_current_cpu_id",
        "__cpu_local_current_cpu_id:",
        "    .long 0xffffffff",
        ".text",
    );

    /// Sets the current CPU's ID using one instruction.
    pub(crate) fn set(id: u32) {
        // SAFETY: The inline assembly writes the ID to this CPU's copy of
        // the cell in one instruction without side effects.
        unsafe {
            core::arch::asm!(
                "mov fs:[__cpu_local_current_cpu_id], {0:e}",
                in(reg) id,
                options(nostack),
            );
        }
    }

    /// Gets the current CPU's ID using one instruction.
    pub(crate) fn get() -> u32 {
        let id: u32;
        // SAFETY: The inline assembly reads the ID from this CPU's copy of
        // the cell in one instruction without side effects.
        unsafe {
            core::arch::asm!(
                "mov {0:e}, fs:[__cpu_local_current_cpu_id]",
                out(reg) id,
                options(nostack, readonly),
            );
        }
        id
    }
}
