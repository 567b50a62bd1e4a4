// SPDX-License-Identifier: MPL-2.0

//! Boot-time platform support.

pub mod smp;
