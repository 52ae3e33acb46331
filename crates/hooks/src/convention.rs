//! Calling conventions and typed function traits
//!
//! [`Function`] classifies a hookable function-pointer type at compile
//! time: calling convention, argument tuple, return type, whether the
//! return travels through a hidden pointer, and the relay thunk for that
//! exact signature. The trait is implemented for safe and unsafe function
//! pointers of up to six arguments, per supported ABI.
//!
//! The relay is the typed end of the codecave: a thunk with the target's
//! own convention plus one leading hook-pointer argument. Its body
//! dispatches to the user callback, or straight through the trampoline
//! when no callback is set.

use std::ptr::NonNull;

use detourkit_mem::Address;

use crate::hook::{Hook, HookCore};

/// The calling conventions the engine can route.
///
/// On 64-bit hosts the lattice collapses to the platform's single native
/// convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    Cdecl,
    Stdcall,
    Thiscall,
    Fastcall,
    Win64,
    Sysv64,
}

impl CallingConvention {
    /// Whether the caller frees the argument area (the relay epilogue
    /// must clean up what the preamble inserted).
    pub fn caller_cleans(self) -> bool {
        matches!(
            self,
            CallingConvention::Cdecl | CallingConvention::Win64 | CallingConvention::Sysv64
        )
    }
}

/// Platform-ABI predicate: the return value does not fit the return
/// registers, so the caller allocates the slot and passes a hidden
/// pointer as the leading argument.
///
/// Sized on the value's shape alone. Types with non-trivial copy or
/// destroy semantics cannot appear in an `extern` function-pointer
/// signature, so for every type a [`Function`] signature can carry this
/// matches the lowering of the relay itself.
pub const fn return_via_hidden_pointer<T>() -> bool {
    let size = std::mem::size_of::<T>();
    if size == 0 {
        return false;
    }
    if cfg!(all(target_arch = "x86_64", not(windows))) {
        // System V packs up to two eightbytes into RAX:RDX
        size > 16
    } else {
        size > 8 || !size.is_power_of_two()
    }
}

/// The leading relay argument carrying the hook object.
///
/// Wrapped in a one-field `repr(C)` struct so every convention receives
/// it the same way; on 32-bit fastcall the aggregate travels on the
/// stack, leaving ECX and EDX to the original register arguments.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HookPtr {
    ptr: *const (),
}

mod sealed {
    pub trait Sealed {}
}

/// A function-pointer type the hook engine can detour.
///
/// Implemented for plain and `unsafe` function pointers of arity 0..=6.
/// Arguments must be integer-class values (integers, pointers,
/// references); signatures passing arguments in XMM registers or
/// splitting aggregates across registers are outside the engine's
/// contract on 64-bit hosts.
///
/// # Safety
/// Implementations promise that `CONVENTION`, `ARITY` and
/// `RETURN_HIDDEN_PTR` describe the pointed-to function's real ABI and
/// that `relay` returns a thunk of exactly that ABI plus the leading
/// hook pointer.
pub unsafe trait Function: Copy + Send + Sync + Sized + sealed::Sealed + 'static {
    /// Argument tuple.
    type Args;

    /// Return type.
    type Output;

    /// Callback shape for this signature: the hook reference followed by
    /// the original argument list.
    type Callback: ?Sized + Send + Sync;

    const CONVENTION: CallingConvention;
    const ARITY: usize;
    const RETURN_HIDDEN_PTR: bool;

    /// The address of the pointed-to function.
    fn to_address(self) -> Address;

    /// Reinterprets `address` as this function type.
    ///
    /// # Safety
    /// `address` must hold code of exactly this signature.
    unsafe fn from_address(address: Address) -> Self;

    /// Calls the code at `address` with this signature (the invoker).
    ///
    /// # Safety
    /// See [`Function::from_address`]; the arguments must satisfy the
    /// callee's contract.
    unsafe fn invoke(address: Address, args: Self::Args) -> Self::Output;

    /// The relay thunk for this signature.
    fn relay() -> Address;
}

macro_rules! impl_function {
    ($abi:tt, $relay_abi:tt, $tag:ident, $conv:expr, $arity:tt $(, ($A:ident, $a:ident))*) => {
        paste::paste! {
            #[allow(non_snake_case, clippy::too_many_arguments)]
            unsafe extern $relay_abi fn [<relay_ $tag _ $arity>]<R, $($A,)*>(
                hook: HookPtr,
                $($a: $A,)*
            ) -> R
            where
                R: 'static,
                $($A: 'static,)*
            {
                let core = hook.ptr as *const HookCore<extern $abi fn($($A),*) -> R>;
                let anchor = NonNull::new_unchecked(
                    core as *mut HookCore<extern $abi fn($($A),*) -> R>,
                );
                let hook = &*(std::ptr::addr_of!(anchor)
                    as *const Hook<extern $abi fn($($A),*) -> R>);
                match (*core).callback() {
                    Some(callback) => callback(hook, $($a),*),
                    None => hook.call($($a),*),
                }
            }

            #[allow(non_snake_case, clippy::too_many_arguments)]
            unsafe extern $relay_abi fn [<relay_ $tag _ $arity _unsafe>]<R, $($A,)*>(
                hook: HookPtr,
                $($a: $A,)*
            ) -> R
            where
                R: 'static,
                $($A: 'static,)*
            {
                let core = hook.ptr as *const HookCore<unsafe extern $abi fn($($A),*) -> R>;
                let anchor = NonNull::new_unchecked(
                    core as *mut HookCore<unsafe extern $abi fn($($A),*) -> R>,
                );
                let hook = &*(std::ptr::addr_of!(anchor)
                    as *const Hook<unsafe extern $abi fn($($A),*) -> R>);
                match (*core).callback() {
                    Some(callback) => callback(hook, $($a),*),
                    None => hook.call($($a),*),
                }
            }

            impl<R, $($A,)*> sealed::Sealed for extern $abi fn($($A),*) -> R
            where
                R: 'static,
                $($A: 'static,)*
            {
            }

            unsafe impl<R, $($A,)*> Function for extern $abi fn($($A),*) -> R
            where
                R: 'static,
                $($A: 'static,)*
            {
                type Args = ($($A,)*);
                type Output = R;
                type Callback = dyn Fn(&Hook<Self>, $($A),*) -> R + Send + Sync;

                const CONVENTION: CallingConvention = $conv;
                const ARITY: usize = $arity;
                const RETURN_HIDDEN_PTR: bool = return_via_hidden_pointer::<R>();

                fn to_address(self) -> Address {
                    Address::new(self as usize)
                }

                unsafe fn from_address(address: Address) -> Self {
                    std::mem::transmute(address.value())
                }

                #[allow(non_snake_case)]
                unsafe fn invoke(address: Address, args: Self::Args) -> R {
                    let function = Self::from_address(address);
                    let ($($a,)*) = args;
                    function($($a),*)
                }

                fn relay() -> Address {
                    Address::new([<relay_ $tag _ $arity>]::<R, $($A),*> as usize)
                }
            }

            impl<R, $($A,)*> sealed::Sealed for unsafe extern $abi fn($($A),*) -> R
            where
                R: 'static,
                $($A: 'static,)*
            {
            }

            unsafe impl<R, $($A,)*> Function for unsafe extern $abi fn($($A),*) -> R
            where
                R: 'static,
                $($A: 'static,)*
            {
                type Args = ($($A,)*);
                type Output = R;
                type Callback = dyn Fn(&Hook<Self>, $($A),*) -> R + Send + Sync;

                const CONVENTION: CallingConvention = $conv;
                const ARITY: usize = $arity;
                const RETURN_HIDDEN_PTR: bool = return_via_hidden_pointer::<R>();

                fn to_address(self) -> Address {
                    Address::new(self as usize)
                }

                unsafe fn from_address(address: Address) -> Self {
                    std::mem::transmute(address.value())
                }

                #[allow(non_snake_case)]
                unsafe fn invoke(address: Address, args: Self::Args) -> R {
                    let function = Self::from_address(address);
                    let ($($a,)*) = args;
                    function($($a),*)
                }

                fn relay() -> Address {
                    Address::new([<relay_ $tag _ $arity _unsafe>]::<R, $($A),*> as usize)
                }
            }

            impl<R, $($A,)*> Hook<extern $abi fn($($A),*) -> R>
            where
                R: 'static,
                $($A: 'static,)*
            {
                /// Calls the original function through the trampoline.
                ///
                /// # Safety
                /// The hook must have a live codecave (installed, or
                /// soft-removed with an outer hook still chained).
                #[allow(clippy::too_many_arguments)]
                pub unsafe fn call(&self, $($a: $A),*) -> R {
                    <extern $abi fn($($A),*) -> R as Function>::invoke(
                        self.trampoline(),
                        ($($a,)*),
                    )
                }
            }

            impl<R, $($A,)*> Hook<unsafe extern $abi fn($($A),*) -> R>
            where
                R: 'static,
                $($A: 'static,)*
            {
                /// Calls the original function through the trampoline.
                ///
                /// # Safety
                /// The hook must have a live codecave (installed, or
                /// soft-removed with an outer hook still chained).
                #[allow(clippy::too_many_arguments)]
                pub unsafe fn call(&self, $($a: $A),*) -> R {
                    <unsafe extern $abi fn($($A),*) -> R as Function>::invoke(
                        self.trampoline(),
                        ($($a,)*),
                    )
                }
            }
        }
    };
}

macro_rules! impl_function_for_abi {
    ($abi:tt, $relay_abi:tt, $tag:ident, $conv:expr) => {
        impl_function!($abi, $relay_abi, $tag, $conv, 0);
        impl_function!($abi, $relay_abi, $tag, $conv, 1, (A1, a1));
        impl_function!($abi, $relay_abi, $tag, $conv, 2, (A1, a1), (A2, a2));
        impl_function!($abi, $relay_abi, $tag, $conv, 3, (A1, a1), (A2, a2), (A3, a3));
        impl_function!(
            $abi, $relay_abi, $tag, $conv, 4,
            (A1, a1), (A2, a2), (A3, a3), (A4, a4)
        );
        impl_function!(
            $abi, $relay_abi, $tag, $conv, 5,
            (A1, a1), (A2, a2), (A3, a3), (A4, a4), (A5, a5)
        );
        impl_function!(
            $abi, $relay_abi, $tag, $conv, 6,
            (A1, a1), (A2, a2), (A3, a3), (A4, a4), (A5, a5), (A6, a6)
        );
    };
}

#[cfg(target_arch = "x86_64")]
const NATIVE_CONVENTION: CallingConvention = if cfg!(windows) {
    CallingConvention::Win64
} else {
    CallingConvention::Sysv64
};

#[cfg(target_arch = "x86_64")]
impl_function_for_abi!("C", "C", c, NATIVE_CONVENTION);
#[cfg(target_arch = "x86_64")]
impl_function_for_abi!("system", "system", system, NATIVE_CONVENTION);
#[cfg(target_arch = "x86_64")]
impl_function_for_abi!("win64", "win64", win64, CallingConvention::Win64);
#[cfg(target_arch = "x86_64")]
impl_function_for_abi!("sysv64", "sysv64", sysv64, CallingConvention::Sysv64);

#[cfg(target_arch = "x86")]
const SYSTEM_CONVENTION: CallingConvention = if cfg!(windows) {
    CallingConvention::Stdcall
} else {
    CallingConvention::Cdecl
};

#[cfg(target_arch = "x86")]
impl_function_for_abi!("C", "C", c, CallingConvention::Cdecl);
#[cfg(target_arch = "x86")]
impl_function_for_abi!("cdecl", "cdecl", cdecl, CallingConvention::Cdecl);
#[cfg(target_arch = "x86")]
impl_function_for_abi!("system", "system", system, SYSTEM_CONVENTION);
#[cfg(target_arch = "x86")]
impl_function_for_abi!("stdcall", "stdcall", stdcall, CallingConvention::Stdcall);
#[cfg(target_arch = "x86")]
impl_function_for_abi!("thiscall", "stdcall", thiscall, CallingConvention::Thiscall);
#[cfg(target_arch = "x86")]
impl_function_for_abi!("fastcall", "fastcall", fastcall, CallingConvention::Fastcall);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_pointer_predicate() {
        assert!(!return_via_hidden_pointer::<()>());
        assert!(!return_via_hidden_pointer::<u8>());
        assert!(!return_via_hidden_pointer::<u64>());
        assert!(return_via_hidden_pointer::<[u8; 32]>());
        #[cfg(all(target_arch = "x86_64", not(windows)))]
        assert!(!return_via_hidden_pointer::<[u32; 3]>());
        #[cfg(windows)]
        assert!(return_via_hidden_pointer::<[u32; 3]>());
    }

    #[test]
    fn test_classification() {
        type Sum = extern "C" fn(i32, i32) -> i32;
        assert_eq!(<Sum as Function>::ARITY, 2);
        assert!(!<Sum as Function>::RETURN_HIDDEN_PTR);
        #[cfg(all(target_arch = "x86_64", not(windows)))]
        assert_eq!(<Sum as Function>::CONVENTION, CallingConvention::Sysv64);
        #[cfg(all(target_arch = "x86_64", windows))]
        assert_eq!(<Sum as Function>::CONVENTION, CallingConvention::Win64);
    }

    #[test]
    fn test_invoker_round_trip() {
        extern "C" fn triple(x: i32) -> i32 {
            x * 3
        }
        type Triple = extern "C" fn(i32) -> i32;
        let address = (triple as Triple).to_address();
        assert!(address.valid());
        let result = unsafe { <Triple as Function>::invoke(address, (14,)) };
        assert_eq!(result, 42);
    }

    #[test]
    fn test_relay_addresses_are_distinct_per_signature() {
        type A = extern "C" fn(i32) -> i32;
        type B = extern "C" fn(u64, u64) -> u64;
        assert!(<A as Function>::relay().valid());
        assert!(<B as Function>::relay().valid());
        assert_ne!(<A as Function>::relay(), <B as Function>::relay());
    }
}
