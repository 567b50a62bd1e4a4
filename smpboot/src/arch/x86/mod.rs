// SPDX-License-Identifier: MPL-2.0

//! Platform-specific code for the x86 platform.

pub mod boot;
pub(crate) mod cpu;
pub(crate) mod kernel;

use x86_64::registers::{
    control::{Cr4, Cr4Flags},
    model_specific::{Efer, EferFlags},
};

/// Enables the CPU features the bring-up code relies on.
///
/// Called on the BSP during initialization and on every AP as the first
/// step of its Rust entry point. The boot assembly already sets the
/// paging-related bits; this makes the remaining control-register state
/// uniform across processors.
pub(crate) fn enable_cpu_features() {
    let mut cr4 = Cr4::read();
    cr4 |= Cr4Flags::FSGSBASE
        | Cr4Flags::OSFXSR
        | Cr4Flags::OSXMMEXCPT_ENABLE
        | Cr4Flags::PAGE_GLOBAL;
    // SAFETY: Turning on these features does not change the semantics of
    // any running code.
    unsafe {
        Cr4::write(cr4);
    }

    // SAFETY: Enabling non-executable page protection only restricts what
    // already-mapped pages may do; nothing executes from data pages here.
    unsafe {
        Efer::update(|efer| {
            *efer |= EferFlags::NO_EXECUTE_ENABLE;
        });
    }
}

/// Parks the current processor forever.
///
/// There is no scheduler during bring-up, so a processor with nothing left
/// to run cannot be resumed meaningfully; it is halted with interrupts
/// disabled and never makes progress again.
pub(crate) fn stop_this_cpu() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}
