// SPDX-License-Identifier: MPL-2.0

//! Architecture-dependent CPU utilities.

pub(crate) mod local;
