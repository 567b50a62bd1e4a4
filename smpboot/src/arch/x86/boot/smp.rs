// SPDX-License-Identifier: MPL-2.0

//! Multiprocessor boot support.
//!
//! The MP initialization protocol defines two classes of processors: the
//! bootstrap processor (BSP) and the application processors (APs).
//! Following a power-up or RESET of an MP system, system hardware
//! dynamically selects one of the processors on the system bus as the BSP.
//! The remaining processors are designated as APs.
//!
//! By the time this module runs, the BSP has set up the system-wide
//! structures the APs need — the boot page table, the 64-bit descriptor
//! table and one context record per AP — while the APs still sit in their
//! reset state, waiting for a startup signal.
//!
//! The wake-up of the APs follows the INIT-SIPI-SIPI IPI sequence:
//!  - Broadcast INIT IPI (initialize the APs to the wait-for-SIPI state)
//!  - Wait
//!  - Broadcast De-assert INIT IPI (only older processors need this step)
//!  - Wait
//!  - Broadcast SIPI IPI (APs exit the wait-for-SIPI state and start
//!    executing the copied boot code)
//!  - Wait
//!  - Broadcast SIPI IPI (in case an AP failed to start)
//!
//! This sequence does not need to be strictly followed, and there may be
//! different considerations in different systems.

use core::sync::atomic::{fence, Ordering};

use acpi::{madt::MadtEntry, AcpiHandler, AcpiTables};
use boot_protocol::PerApRawInfo;

use crate::{
    arch::x86::kernel::apic::{
        self, DeliveryMode, DestinationShorthand, Icr, Level, TriggerMode,
    },
    mm::{paddr_to_vaddr, Paddr, PAGE_SIZE},
};

core::arch::global_asm!(include_str!("ap_boot.S"));

/// Counts the processors of the platform, the BSP included.
///
/// The caller owns the ACPI table discovery; only the counting lives here.
/// Returns `None` if the tables carry no MADT.
pub fn count_processors<H: AcpiHandler>(tables: &AcpiTables<H>) -> Option<u32> {
    let madt_table = tables.find_table::<acpi::madt::Madt>().ok()?;

    // According to ACPI spec [1], "If this bit [the Enabled bit] is set the processor is ready for
    // use. If this bit is clear and the Online Capable bit is set, system hardware supports
    // enabling this processor during OS runtime."
    // [1]: https://uefi.org/htmlspecs/ACPI_Spec_6_4_html/05_ACPI_Software_Programming_Model/ACPI_Software_Programming_Model.html#local-apic-flags
    fn is_usable(flags: u32) -> bool {
        const ENABLED: u32 = 0b01;
        const ONLINE_CAPABLE: u32 = 0b10;

        (flags & ENABLED) != 0 || (flags & ONLINE_CAPABLE) != 0
    }

    // According to ACPI spec [1], "Logical processors with APIC ID values less than 255 (whether
    // in XAPIC or X2APIC mode) must use the Processor Local APIC structure to convey their APIC
    // information to OSPM [..] Logical processors with APIC ID values 255 and greater must use the
    // Processor Local x2APIC structure [..]"
    // [1]: https://uefi.org/htmlspecs/ACPI_Spec_6_4_html/05_ACPI_Software_Programming_Model/ACPI_Software_Programming_Model.html#processor-local-x2apic-structure
    let is_dup_apic = |id: u32| -> bool {
        // Check if the APIC entry also shows up as an x2APIC entry.
        if madt_table.get().entries().any(|e| {
            matches!(e, MadtEntry::LocalX2Apic(e)
                if e.x2apic_id == id && is_usable(e.flags))
        }) {
            log::warn!(
                "Firmware bug: In MADT, APIC ID {} is also listed as an x2APIC ID",
                id,
            );
            true
        } else {
            false
        }
    };

    let local_apic_counts = madt_table
        .get()
        .entries()
        .filter(|e| match e {
            MadtEntry::LocalX2Apic(entry) => {
                log::trace!("Found a local x2APIC entry in MADT: {:?}", entry);
                is_usable(entry.flags)
            }
            MadtEntry::LocalApic(entry) => {
                log::trace!("Found a local APIC entry in MADT: {:?}", entry);
                is_usable(entry.flags) && !is_dup_apic(entry.apic_id as u32)
            }
            _ => false,
        })
        .count();

    Some(local_apic_counts as u32)
}

/// The BSP-owned tables a booting AP consumes.
///
/// Both tables are constructed elsewhere; this crate only carries their
/// addresses into the AP boot code and never inspects them.
#[derive(Debug, Clone, Copy)]
pub struct ApBootTables {
    /// The physical address of the boot page table root.
    ///
    /// Must be below 4 GiB: APs woken from real mode load it while still
    /// executing 32-bit code.
    pub page_table_root: Paddr,
    /// The pseudo-descriptor of the shared 64-bit descriptor table.
    pub gdt_pointer: RawGdtPointer,
}

/// A pseudo-descriptor locating a descriptor table: its limit and its
/// physical base address.
///
/// The base must be below 4 GiB, and the table it locates must carry a
/// 64-bit code descriptor at selector 0x8 and a data descriptor at
/// selector 0x10.
#[derive(Debug, Clone, Copy)]
pub struct RawGdtPointer {
    /// The size of the table in bytes, minus one.
    pub limit: u16,
    /// The physical base address of the table.
    pub base: u64,
}

/// This is where the linker links the symbols in the `.ap_boot` section.
/// The BSP copies the AP boot code to this address before waking any AP.
pub(crate) const AP_BOOT_START_PA: usize = 0x8000;

/// The size of the AP boot code (the `.ap_boot` section).
fn ap_boot_code_size() -> usize {
    __ap_boot_end as usize - __ap_boot_start as usize
}

/// Brings up all application processors.
///
/// # Safety
///
/// The caller must ensure that:
///  - `info_ptr` points to one fully populated context record per AP;
///  - `tables` locates a fully constructed page table and descriptor
///    table, neither of which changes while any AP may consume them;
///  - the boot page table maps the `.ap_boot` physical page and the
///    published tables at their physical addresses, and keeps the linear
///    mapping intact;
///  - this function is called only once, on the BSP.
pub(crate) unsafe fn bringup_all_aps(info_ptr: *const PerApRawInfo, tables: ApBootTables) {
    copy_ap_boot_code();

    fill_gdt_ptr(tables.gdt_pointer);
    fill_boot_pt_ptr(tables.page_table_root);
    fill_boot_info_ptr(info_ptr);

    // The publications above are release-ordered, and the SIPI delivery
    // architecturally happens after them. The fence makes the edge
    // explicit instead of leaning on the wake-up mechanism alone.
    fence(Ordering::SeqCst);

    send_boot_ipis();
}

// The load addresses of the `.ap_boot` section bounds, provided by the
// linker script. The symbols inside the section resolve to the copy
// destination instead, since the section is linked at `AP_BOOT_START_PA`.
extern "C" {
    fn __ap_boot_start();
    fn __ap_boot_end();
}

extern "C" {
    static __ap_boot_info_array_pointer: u64;
    static __ap_boot_page_table_pointer: u64;
    static __ap_boot_gdt_pointer: u8;
}

fn copy_ap_boot_code() {
    let src = __ap_boot_start as usize as *const u8;

    // SAFETY: The linker script guarantees the source range holds the
    // `.ap_boot` image, and the destination page is reserved for it.
    unsafe {
        core::ptr::copy_nonoverlapping(
            src,
            paddr_to_vaddr(AP_BOOT_START_PA) as *mut u8,
            ap_boot_code_size(),
        );
    }
}

/// Returns a writable pointer to a slot inside the copied boot image.
///
/// The slot symbols are linked at their physical destination addresses,
/// so a symbol's address doubles as the physical address of its copy.
fn ap_boot_slot<T>(slot_addr: usize) -> *mut T {
    paddr_to_vaddr(slot_addr) as *mut T
}

fn fill_boot_info_ptr(info_ptr: *const PerApRawInfo) {
    // SAFETY: The slot is defined in `ap_boot.S`, aligned to 8 bytes and
    // zero-initialized; it is written exactly once, before any AP reads
    // it, and the record array outlives the boot phase.
    unsafe {
        let slot = ap_boot_slot::<u64>(&__ap_boot_info_array_pointer as *const u64 as usize);
        boot_protocol::publish_ptr(slot, info_ptr as u64);
    }
}

fn fill_boot_pt_ptr(page_table_root: Paddr) {
    assert!(
        page_table_root < u32::MAX as usize,
        "the boot page table root must be below 4 GiB"
    );

    // SAFETY: The slot is defined in `ap_boot.S`, aligned to 8 bytes and
    // zero-initialized; it is written exactly once, before any AP reads
    // it, and the page table outlives the boot phase.
    unsafe {
        let slot = ap_boot_slot::<u64>(&__ap_boot_page_table_pointer as *const u64 as usize);
        boot_protocol::publish_ptr(slot, page_table_root as u64);
    }
}

fn fill_gdt_ptr(gdt_pointer: RawGdtPointer) {
    assert!(
        gdt_pointer.base < u32::MAX as u64,
        "the shared descriptor table must be below 4 GiB"
    );

    // SAFETY: The slot is defined in `ap_boot.S` as a 10-byte
    // pseudo-descriptor; it is written exactly once, before any AP reads
    // it. The base field is unaligned by the pseudo-descriptor format.
    unsafe {
        let slot = ap_boot_slot::<u8>(&__ap_boot_gdt_pointer as *const u8 as usize);
        (slot as *mut u16).write_volatile(gdt_pointer.limit);
        (slot.add(2) as *mut u64).write_unaligned(gdt_pointer.base);
    }
}

/// Sends IPIs to notify all application processors to boot.
///
/// Follow the INIT-SIPI-SIPI IPI sequence.
/// Here, we don't check whether there is an AP that failed to start,
/// but send the second SIPI directly (checking whether each core is
/// started successfully one by one will bring extra overhead). For
/// APs that have been started, this signal will not bring any cost.
fn send_boot_ipis() {
    send_init_to_all_aps();
    spin_wait_cycles(100_000_000);

    send_init_deassert();
    spin_wait_cycles(20_000_000);

    send_startup_to_all_aps();
    spin_wait_cycles(20_000_000);

    send_startup_to_all_aps();
    spin_wait_cycles(20_000_000);
}

fn send_startup_to_all_aps() {
    let icr = Icr::new(
        DestinationShorthand::AllExcludingSelf,
        TriggerMode::Edge,
        Level::Assert,
        DeliveryMode::StartUp,
        (AP_BOOT_START_PA / PAGE_SIZE) as u8,
    );
    // SAFETY: APs in the wait-for-SIPI state accept the startup IPI.
    unsafe { apic::send_ipi(icr) };
}

fn send_init_to_all_aps() {
    let icr = Icr::new(
        DestinationShorthand::AllExcludingSelf,
        TriggerMode::Level,
        Level::Assert,
        DeliveryMode::Init,
        0,
    );
    // SAFETY: APs still sit in their reset state; the INIT IPI is what
    // moves them to the wait-for-SIPI state.
    unsafe { apic::send_ipi(icr) };
}

fn send_init_deassert() {
    let icr = Icr::new(
        DestinationShorthand::AllIncludingSelf,
        TriggerMode::Level,
        Level::Deassert,
        DeliveryMode::Init,
        0,
    );
    // SAFETY: The de-assert is a no-op on processors past the INIT state.
    unsafe { apic::send_ipi(icr) };
}

/// Spin wait approximately `c` cycles.
///
/// Since the timer requires CPU-local storage to be fully initialized,
/// we can only wait by spinning.
fn spin_wait_cycles(c: u64) {
    fn duration(from: u64, to: u64) -> u64 {
        if to >= from {
            to - from
        } else {
            u64::MAX - from + to
        }
    }

    use core::arch::x86_64::_rdtsc;

    // SAFETY: Reading the time-stamp counter has no side effects.
    let start = unsafe { _rdtsc() };

    while duration(start, unsafe { _rdtsc() }) < c {
        core::hint::spin_loop();
    }
}
