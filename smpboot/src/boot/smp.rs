// SPDX-License-Identifier: MPL-2.0

//! Symmetric multiprocessing (SMP) boot support.
//!
//! The bootstrap processor (BSP) prepares one context record per
//! application processor (AP) — a boot stack and a CPU-local storage area —
//! publishes the record array together with the boot page table and the
//! shared descriptor table, and wakes the APs. Every woken AP races
//! through the same boot code, takes a unique CPU ID, installs the context
//! stored at index `id - 1`, and parks in [`ap_early_entry`] until the
//! kernel registers its entry point with [`register_ap_entry`].

use core::alloc::Layout;
use core::sync::atomic::{AtomicBool, Ordering};

use align_ext::AlignExt;
use boot_protocol::PerApRawInfo;
use spin::Once;

use crate::{
    arch,
    arch::boot::smp::{bringup_all_aps, ApBootTables},
    cpu::{self, CpuId},
    mm::{frame, paddr_to_vaddr, PAGE_SIZE},
};

pub(crate) static AP_BOOT_INFO: Once<ApBootInfo> = Once::new();

const AP_BOOT_STACK_SIZE: usize = PAGE_SIZE * 64;

pub(crate) struct ApBootInfo {
    /// The raw context records consumed by the AP boot assembly, one per
    /// AP, indexed by `cpu_id - 1`. Read-only once published.
    info_array: &'static [PerApRawInfo],
    /// Bring-up bookkeeping per AP, indexed by `cpu_id - 1`.
    per_ap_info: &'static [PerApInfo],
}

struct PerApInfo {
    is_started: AtomicBool,
}

static AP_LATE_ENTRY: Once<fn()> = Once::new();

/// Boots all application processors.
///
/// This function should be called late in the BSP's startup, after
/// [`crate::init`]; the APs come online one by one as they win the race on
/// the shared CPU ID counter, and the function returns once every one of
/// them has reported in.
///
/// # Safety
///
/// The caller must ensure that:
///  - `tables` locates a fully constructed boot page table and 64-bit
///    descriptor table, per the documentation of [`ApBootTables`];
///  - this function is called only once, on the BSP, after [`crate::init`].
pub unsafe fn boot_all_aps(tables: ApBootTables) {
    let num_cpus = cpu::num_cpus() as u32;

    if num_cpus == 1 {
        log::info!("No application processors to boot.");
        return;
    }
    assert!(
        u64::from(num_cpus) <= boot_protocol::MAX_APS + 1,
        "too many processors for the boot protocol"
    );

    AP_BOOT_INFO.call_once(|| {
        let num_aps = (num_cpus - 1) as usize;

        let info_ptr = {
            let size = core::mem::size_of::<PerApRawInfo>()
                .checked_mul(num_aps)
                .unwrap()
                .align_up(PAGE_SIZE);
            let pa = frame::early_alloc(Layout::from_size_align(size, PAGE_SIZE).unwrap())
                .expect("insufficient bootstrap memory for the AP record array");
            paddr_to_vaddr(pa) as *mut PerApRawInfo
        };

        let per_ap_ptr = {
            let size = core::mem::size_of::<PerApInfo>()
                .checked_mul(num_aps)
                .unwrap()
                .align_up(PAGE_SIZE);
            let pa = frame::early_alloc(Layout::from_size_align(size, PAGE_SIZE).unwrap())
                .expect("insufficient bootstrap memory for the AP bookkeeping");
            paddr_to_vaddr(pa) as *mut PerApInfo
        };

        for ap in 1..num_cpus {
            // TODO: Reclaim the boot stack once the AP has switched to its
            // runtime stack; the same applies to the BSP's boot stack.
            let stack_pa = frame::early_alloc(
                Layout::from_size_align(AP_BOOT_STACK_SIZE, PAGE_SIZE).unwrap(),
            )
            .expect("insufficient bootstrap memory for an AP boot stack");
            let stack_top = paddr_to_vaddr(stack_pa + AP_BOOT_STACK_SIZE);

            let cpu_local = paddr_to_vaddr(cpu::local::get_ap(
                CpuId::try_from(ap as usize).unwrap(),
            ));

            let index = (ap - 1) as usize;
            // SAFETY: Both arrays are freshly allocated and exclusively
            // owned until the surrounding `call_once` returns.
            unsafe {
                info_ptr.add(index).write_volatile(PerApRawInfo {
                    stack_top: stack_top as u64,
                    cpu_local: cpu_local as u64,
                });
                per_ap_ptr.add(index).write(PerApInfo {
                    is_started: AtomicBool::new(false),
                });
            }
        }

        // SAFETY: The arrays are fully initialized above and are never
        // deallocated, so they live for `'static`.
        unsafe {
            ApBootInfo {
                info_array: core::slice::from_raw_parts(info_ptr, num_aps),
                per_ap_info: core::slice::from_raw_parts(per_ap_ptr, num_aps),
            }
        }
    });

    log::info!("Booting {} application processors...", num_cpus - 1);

    // SAFETY: The records are fully populated, and the caller guarantees
    // the tables are ready; this is the only call site.
    unsafe {
        bringup_all_aps(AP_BOOT_INFO.get().unwrap().info_array.as_ptr(), tables);
    }

    wait_for_all_aps_started();

    log::info!("All application processors started. The BSP continues to run.");
}

/// Registers the entry function for the application processors.
///
/// Once the entry function is registered, all the application processors
/// that have reported in jump to it immediately. The function must not
/// return; a processor whose entry function returns is halted permanently.
pub fn register_ap_entry(entry: fn()) {
    AP_LATE_ENTRY.call_once(|| entry);
}

/// The Rust code a booting AP runs right after the boot assembly.
///
/// At this point the AP executes at the linked virtual addresses with its
/// own stack and CPU-local base installed; `cpu_id` is the identity it
/// allocated for itself in the assembly.
#[no_mangle]
extern "sysv64" fn ap_early_entry(cpu_id: u32) -> ! {
    arch::enable_cpu_features();

    // SAFETY: We are on an AP that runs this once, with the ID it
    // allocated for itself.
    unsafe { cpu::local::init_on_ap(cpu_id) };

    let ap_boot_info = AP_BOOT_INFO.get().unwrap();
    ap_boot_info.per_ap_info[(cpu_id - 1) as usize]
        .is_started
        .store(true, Ordering::Release);

    log::info!("Processor {} started. Waiting for the kernel entry point.", cpu_id);

    let ap_late_entry = AP_LATE_ENTRY.wait();
    ap_late_entry();

    // The entry must not return: there is no scheduler that could resume
    // this processor meaningfully.
    log::error!("Processor {}: the entry function returned; parking.", cpu_id);
    arch::stop_this_cpu();
}

fn wait_for_all_aps_started() {
    fn is_all_aps_started() -> bool {
        let ap_boot_info = AP_BOOT_INFO.get().unwrap();
        ap_boot_info
            .per_ap_info
            .iter()
            .all(|info| info.is_started.load(Ordering::Acquire))
    }

    while !is_all_aps_started() {
        core::hint::spin_loop();
    }
}
