//! Architecture-specific context switching
//!
//! Each backend provides the same three items:
//!
//! - `SavedRegs` - callee-saved register file of a suspended context
//! - `init_context` - prepare a fresh stack so the first switch enters `entry(arg)`
//! - `switch_context` - save the caller into `old`, resume `new`

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{init_context, switch_context, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{init_context, switch_context, SavedRegs};
    } else {
        compile_error!("greenbridge supports x86_64 and aarch64 only");
    }
}

/// Signature of the function a fresh fiber stack starts in
pub type EntryFn = extern "C" fn(usize) -> !;
