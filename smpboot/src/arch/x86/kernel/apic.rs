// SPDX-License-Identifier: MPL-2.0

//! A minimal local APIC sender.
//!
//! Waking application processors needs exactly one capability from the
//! interrupt controller: delivering broadcast inter-processor interrupts
//! from the bootstrap processor. This module provides that and nothing
//! more; the system's full APIC driver lives with the interrupt
//! subsystem, outside this crate.

use bit_field::BitField;
use x86::msr::{rdmsr, wrmsr, IA32_APIC_BASE, IA32_X2APIC_ESR, IA32_X2APIC_ICR};

use crate::mm::paddr_to_vaddr;

/// The inter-processor interrupt command register.
///
/// ICR is a 64-bit local APIC register that allows software running on the
/// processor to specify and send IPIs to other processors in the system.
/// The act of writing to the low doubleword of the ICR causes the IPI to
/// be sent; in xAPIC mode the high doubleword therefore has to be written
/// first.
///
/// The fields used here:
/// - **Bit 0-7**   Vector: the vector number of the interrupt being sent.
/// - **Bit 8-10**  Delivery Mode: the type of IPI to be sent.
/// - **Bit 14**    Level: only cleared for the INIT de-assert delivery.
/// - **Bit 15**    Trigger Mode: level or edge.
/// - **Bit 18-19** Destination Shorthand: the destination set.
///
/// Every IPI of the boot sequence is a shorthand broadcast, so the
/// destination field (bits 56-63 in xAPIC mode, 32-63 in x2APIC mode) is
/// never set.
pub(crate) struct Icr(u64);

impl Icr {
    pub(crate) fn new(
        destination_shorthand: DestinationShorthand,
        trigger_mode: TriggerMode,
        level: Level,
        delivery_mode: DeliveryMode,
        vector: u8,
    ) -> Self {
        Icr((destination_shorthand as u64) << 18
            | (trigger_mode as u64) << 15
            | (level as u64) << 14
            | (delivery_mode as u64) << 8
            | (vector as u64))
    }

    /// Returns the lower 32 bits of the ICR.
    fn lower(&self) -> u32 {
        self.0 as u32
    }

    /// Returns the higher 32 bits of the ICR.
    fn upper(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

#[repr(u64)]
pub(crate) enum DestinationShorthand {
    AllIncludingSelf = 0b10,
    AllExcludingSelf = 0b11,
}

#[repr(u64)]
pub(crate) enum TriggerMode {
    Edge = 0,
    Level = 1,
}

#[repr(u64)]
pub(crate) enum Level {
    Deassert = 0,
    Assert = 1,
}

#[repr(u64)]
pub(crate) enum DeliveryMode {
    /// Initializes the target processors to the wait-for-startup state.
    Init = 0b101,
    /// Makes the target processors start executing at the vector-designated
    /// page (a SIPI).
    StartUp = 0b110,
}

/// Sends an inter-processor interrupt through this processor's local APIC.
///
/// # Safety
///
/// The caller must ensure that delivering the interrupt command is safe:
/// the target processors must be in a state where receiving it does not
/// corrupt them.
pub(crate) unsafe fn send_ipi(icr: Icr) {
    if in_x2apic_mode() {
        // SAFETY: Writing a well-formed interrupt command to the x2APIC
        // command MSR is safe as per the caller's guarantee. The x2APIC
        // has no delivery-status field to wait on.
        unsafe {
            wrmsr(IA32_X2APIC_ESR, 0);
            wrmsr(IA32_X2APIC_ICR, icr.0);
        }
        return;
    }

    // The memory-mapped xAPIC register layout, in 32-bit registers.
    const XAPIC_ESR: usize = 0x280 / 4;
    const XAPIC_ICR0: usize = 0x300 / 4;
    const XAPIC_ICR1: usize = 0x310 / 4;
    // Bit 12 of ICR0 is the read-only delivery status.
    const DELIVERY_STATUS_BIT: usize = 12;

    let regs = paddr_to_vaddr(xapic_base_address()) as *mut u32;

    // SAFETY: The MMIO accesses target the local APIC register page,
    // which the boot page table keeps mapped in the linear mapping, and
    // the command itself is safe as per the caller's guarantee.
    unsafe {
        regs.add(XAPIC_ESR).write_volatile(0);
        // Writing the low doubleword triggers the send, so the high
        // doubleword must go first.
        regs.add(XAPIC_ICR1).write_volatile(icr.upper());
        regs.add(XAPIC_ICR0).write_volatile(icr.lower());
        while regs.add(XAPIC_ICR0).read_volatile().get_bit(DELIVERY_STATUS_BIT) {
            core::hint::spin_loop();
        }
    }
}

fn in_x2apic_mode() -> bool {
    const EXTD_BIT_IDX: usize = 10;
    // SAFETY: Reading `IA32_APIC_BASE` has no side effects.
    let base = unsafe { rdmsr(IA32_APIC_BASE) };
    base.get_bit(EXTD_BIT_IDX)
}

fn xapic_base_address() -> usize {
    // SAFETY: Reading `IA32_APIC_BASE` has no side effects.
    let base = unsafe { rdmsr(IA32_APIC_BASE) };
    (base as usize) & 0xf_ffff_f000
}
