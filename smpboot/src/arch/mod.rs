// SPDX-License-Identifier: MPL-2.0

//! Platform-specific code.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86;
        pub use self::x86::*;
    }
}
