// SPDX-License-Identifier: MPL-2.0

//! CPU-local storage bootstrap.
//!
//! CPU-local objects live in the special `.cpu_local` section, which the
//! linker script places at virtual offset zero so that every symbol in it
//! is an offset from the per-CPU base register (FS). The bootstrap
//! processor (BSP) uses the section image linked into the kernel; before
//! the application processors (APs) boot, the image is copied into one
//! freshly allocated area per AP, and each AP's copy becomes its private
//! storage the moment the boot assembly installs the area's address as the
//! FS base.

use core::alloc::Layout;

use align_ext::AlignExt;
use spin::Once;

use crate::{
    cpu::CpuId,
    mm::{frame, paddr_to_vaddr, Paddr, PAGE_SIZE},
};

// These symbols are provided by the linker script.
extern "C" {
    fn __cpu_local_start();
    fn __cpu_local_end();
}

/// The CPU-local areas for APs.
static CPU_LOCAL_STORAGES: Once<&'static [Paddr]> = Once::new();

/// Copies the CPU-local data on the bootstrap processor (BSP)
/// for application processors (APs).
///
/// # Safety
///
/// This function must be called in the boot context of the BSP, at a time
/// when the APs have not yet booted.
///
/// The CPU-local data on the BSP must not be used before calling this
/// function to copy it for the APs. Otherwise, the copied data will
/// contain non-constant (also non-`Copy`) data, resulting in undefined
/// behavior when it's loaded on the APs.
///
/// The caller must ensure that the `num_cpus` matches the number of all
/// CPUs that will access the CPU-local storage.
pub(crate) unsafe fn copy_bsp_for_ap(num_cpus: usize) {
    let num_aps = num_cpus - 1; // BSP does not need allocated storage.
    if num_aps == 0 {
        return;
    }

    // A region to store the pointers to the CPU-local storage areas.
    let res = {
        let size = core::mem::size_of::<Paddr>()
            .checked_mul(num_aps)
            .unwrap()
            .align_up(PAGE_SIZE);
        let addr =
            frame::early_alloc(Layout::from_size_align(size, PAGE_SIZE).unwrap()).unwrap();
        let ptr = paddr_to_vaddr(addr) as *mut Paddr;

        // SAFETY: The memory is properly allocated. We exclusively own it.
        // So it's valid to write.
        unsafe {
            core::ptr::write_bytes(ptr as *mut u8, 0, size);
        }
        // SAFETY: The memory is properly allocated and initialized. We
        // exclusively own it. We never deallocate it so it lives for
        // `'static`. So we can create a mutable slice on it.
        unsafe { core::slice::from_raw_parts_mut(ptr, num_aps) }
    };

    let bsp_base_va = __cpu_local_start as usize;
    let bsp_end_va = __cpu_local_end as usize;

    // Allocate the CPU-local storage areas for APs.
    for res_addr_mut in res.iter_mut() {
        let nbytes = (bsp_end_va - bsp_base_va).align_up(PAGE_SIZE);
        let ap_pages =
            frame::early_alloc(Layout::from_size_align(nbytes, PAGE_SIZE).unwrap()).unwrap();
        let ap_pages_ptr = paddr_to_vaddr(ap_pages) as *mut u8;

        // SAFETY:
        // 1. The source is valid to read because it has not been used
        //    before, so it contains only constants.
        // 2. The destination is valid to write because it is just
        //    allocated.
        // 3. The memory is aligned because the alignment of `u8` is 1.
        // 4. The two memory regions do not overlap because allocated
        //    memory regions never overlap with the kernel data.
        unsafe {
            core::ptr::copy_nonoverlapping(bsp_base_va as *const u8, ap_pages_ptr, nbytes);
        }

        *res_addr_mut = ap_pages;
    }

    is_used::debug_assert_false();

    assert!(!CPU_LOCAL_STORAGES.is_completed());
    CPU_LOCAL_STORAGES.call_once(|| res);
}

/// Gets the physical address of the CPU-local storage of the given AP.
///
/// # Panics
///
/// This method will panic if the `cpu_id` does not represent an AP or the
/// AP's CPU-local storage has not been allocated.
pub(crate) fn get_ap(cpu_id: CpuId) -> Paddr {
    let offset = cpu_id
        .as_usize()
        .checked_sub(1)
        .expect("The BSP does not have allocated CPU-local storage");

    let paddr = CPU_LOCAL_STORAGES
        .get()
        .expect("No CPU-local storage has been allocated")[offset];
    assert_ne!(
        paddr,
        0,
        "The CPU-local storage for CPU {} is not allocated",
        cpu_id.as_usize(),
    );
    paddr
}

/// Initializes the CPU-local storage on the BSP.
///
/// # Safety
///
/// The caller must ensure that this function is called only once, on the
/// BSP, after [`copy_bsp_for_ap`] has snapshotted the pristine image.
pub(crate) unsafe fn init_on_bsp() {
    // SAFETY: The FS register is dedicated to CPU-local storage, and the
    // section image linked into the kernel is the BSP's storage.
    unsafe {
        crate::arch::cpu::local::set_base(__cpu_local_start as usize as u64);
    }

    // SAFETY: The base is installed and this runs once on the BSP.
    unsafe { crate::cpu::set_this_cpu_id(CpuId::bsp().as_usize() as u32) };
}

/// Finishes the CPU-local storage initialization on an AP.
///
/// The boot assembly has already installed the AP's storage area as the
/// FS base, as part of loading the per-AP context record.
///
/// # Safety
///
/// The caller must ensure that this function is called only once on each
/// AP, with the ID the AP allocated for itself.
pub(crate) unsafe fn init_on_ap(cpu_id: u32) {
    debug_assert_eq!(
        crate::arch::cpu::local::get_base() as usize,
        paddr_to_vaddr(get_ap(CpuId::try_from(cpu_id as usize).unwrap())),
        "The boot assembly did not install this AP's CPU-local base"
    );

    // SAFETY: The base is installed and this runs once on this AP.
    unsafe { crate::cpu::set_this_cpu_id(cpu_id) };
}

pub(crate) mod is_used {
    //! This module tracks whether any CPU-local variables are used.
    //!
    //! [`copy_bsp_for_ap`] copies the CPU local data from the BSP
    //! to the APs, so it requires as a safety condition that the
    //! CPU-local data has not been accessed before the copy. This
    //! module provides utilities to check if the safety condition
    //! is met, but only if debug assertions are enabled.
    //!
    //! [`copy_bsp_for_ap`]: super::copy_bsp_for_ap

    cfg_if::cfg_if! {
        if #[cfg(debug_assertions)] {
            use core::sync::atomic::{AtomicBool, Ordering};

            static IS_USED: AtomicBool = AtomicBool::new(false);

            pub fn debug_set_true() {
                IS_USED.store(true, Ordering::Relaxed);
            }

            pub fn debug_assert_false() {
                debug_assert!(!IS_USED.load(Ordering::Relaxed));
            }
        } else {
            pub fn debug_set_true() {}

            pub fn debug_assert_false() {}
        }
    }
}
