//! Architecture-specific context switching
//!
//! Each backend provides a `Context` holding the callee-saved registers of a
//! suspended fiber, `init_context` to prepare a fresh context that starts in
//! an entry function on a new stack, and `switch_context` to save the
//! running context and resume another.

/// Entry point of a fresh context; receives the argument given to
/// `init_context` and must never return.
pub type EntryFn = extern "C" fn(usize) -> !;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{init_context, switch_context, Context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{init_context, switch_context, Context};
    } else {
        compile_error!("fiberio supports x86_64 and aarch64 only");
    }
}
