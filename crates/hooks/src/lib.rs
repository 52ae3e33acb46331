//! detourkit hook engine
//!
//! Detour hooks over typed function signatures: the target prologue is
//! rewritten into a near jump through a per-hook codecave, a relay hands
//! control to a user callback, and the callback can re-enter the original
//! through a trampoline. Hooks on the same target compose into a chain
//! and can be removed in any order.
//!
//! - [`hook`] - the [`Hook`] engine itself
//! - [`convention`] - calling-convention classification and the invoker
//! - [`disasm`] - the single-instruction decoder
//! - [`context`] - the register snapshot taken at hook entry
//!
//! The low-level memory toolkit this builds on is re-exported as [`mem`].

mod codecave;
pub mod context;
pub mod convention;
pub mod disasm;
pub mod error;
pub mod hook;

// Re-export the memory toolkit for consumers of the hook engine
pub use detourkit_mem as mem;

// Re-export commonly used items
pub use context::Context;
pub use convention::{return_via_hidden_pointer, CallingConvention, Function, HookPtr};
pub use disasm::{Disassembler, Instruction, Prologue};
pub use error::HookError;
pub use hook::Hook;
