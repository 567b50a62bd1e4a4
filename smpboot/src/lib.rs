// SPDX-License-Identifier: MPL-2.0

//! Application processor bring-up for x86-64 kernels.
//!
//! After a platform reset, only the bootstrap processor (BSP) runs; the
//! application processors (APs) sit in a minimal reset state until they are
//! signaled. This crate is the code an AP executes from that signal until
//! it enters shared 64-bit kernel logic: the mode-transition assembly, the
//! racing CPU-identity allocation, the per-CPU context installation, and
//! the handoff to a registered kernel entry point. It also carries the
//! BSP-side half that prepares and publishes the shared structures and
//! delivers the wake-up signal.
//!
//! The crate trusts its caller completely. The BSP must have constructed
//! the boot page table and the 64-bit descriptor table before booting any
//! AP; nothing here validates them, and a violated precondition is
//! undefined processor behavior with no recovery path.
//!
//! # Usage
//!
//! On the BSP, after the platform is enumerated and the boot page table is
//! in place:
//!
//! ```ignore
//! // SAFETY: Called once on the BSP; the memory region is unused.
//! unsafe { smpboot::init(num_cpus, bootstrap_memory) };
//!
//! smpboot::boot::smp::register_ap_entry(ap_main);
//! // SAFETY: The page table and descriptor table are fully constructed.
//! unsafe { smpboot::boot::smp::boot_all_aps(tables) };
//! ```
//!
//! The consumer's linker script must include `framework.ld`, which places
//! the AP boot code and the CPU-local storage image.
//!
//! The crate only builds for bare-metal x86-64 targets; for hosted targets
//! it compiles to an empty library so that workspace-wide test runs stay
//! possible.

#![no_std]
#![warn(missing_docs)]

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {
        pub mod arch;
        pub mod boot;
        pub mod cpu;
        pub mod mm;

        use core::ops::Range;

        use crate::mm::Paddr;

        /// Initializes the bring-up subsystem on the BSP.
        ///
        /// `num_cpus` is the total number of processors that may run,
        /// including the BSP (see
        /// [`arch::boot::smp::count_processors`]). `bootstrap_memory` is a
        /// physical memory region handed over for boot stacks and per-AP
        /// CPU-local storage; it is never returned.
        ///
        /// # Safety
        ///
        /// The caller must ensure that:
        ///  - this function is called exactly once, on the BSP, before any
        ///    AP is woken and before any CPU-local state is accessed;
        ///  - `bootstrap_memory` is unused free memory covered by the
        ///    kernel's linear mapping;
        ///  - `num_cpus` is at least 1 and counts every processor that may
        ///    execute the AP boot code.
        pub unsafe fn init(num_cpus: u32, bootstrap_memory: Range<Paddr>) {
            arch::enable_cpu_features();

            mm::frame::init(bootstrap_memory);

            // SAFETY: Called once on the BSP, as the caller guarantees.
            unsafe { cpu::init_num_cpus(num_cpus) };

            // SAFETY: No CPU-local state has been accessed so far, and we
            // are on the BSP.
            unsafe { cpu::local::copy_bsp_for_ap(num_cpus as usize) };

            // SAFETY: The CPU-local storage of the BSP has been copied for
            // the APs and can be used from now on.
            unsafe { cpu::local::init_on_bsp() };
        }
    }
}
