// SPDX-License-Identifier: MPL-2.0

//! Drivers for the basic kernel-facing hardware of the x86 platform.

pub(crate) mod apic;
