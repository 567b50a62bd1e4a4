// SPDX-License-Identifier: MPL-2.0

//! Boot-time facilities.

pub mod smp;
