//! Detour hooks
//!
//! A [`Hook`] routes a typed function target through a per-hook codecave:
//! the target prologue is overwritten with a near jump into the cave, the
//! cave relays into the user callback, and the callback can re-enter the
//! original through the trampoline. Multiple hooks on one target chain
//! through each other's caves and can be removed in any order.
//!
//! Installation and removal are not synchronized against concurrent
//! execution of the target; the caller provides quiescence. The installed
//! hot path itself is safe to run from any thread as long as the callback
//! is.

use std::marker::PhantomData;
use std::ptr::NonNull;

use detourkit_mem::alloc::ScopedMemoryBlock;
use detourkit_mem::protect::{self, Protection, ScopedProtect};
use detourkit_mem::{ops, Address, Module};

use crate::codecave::{
    self, CaveLayout, CODECAVE_SIZE, JMP_FAMILY_MASK, JMP_REL32_SIZE, OPCODE_CALL_REL32,
    OPCODE_JMP_REL32, OPCODE_NOP,
};
use crate::context::Context;
use crate::convention::Function;
use crate::disasm::Disassembler;
use crate::error::HookError;

/// Hook state, heap-pinned for the lifetime of the owning [`Hook`] so the
/// emitted codecave can embed its address.
pub(crate) struct HookCore<F: Function> {
    pub(crate) target: Address,
    pub(crate) callback: Option<Box<F::Callback>>,
    pub(crate) codecave: Option<ScopedMemoryBlock>,
    pub(crate) trampoline: Address,
    pub(crate) prologue_len: usize,
    pub(crate) original_prologue: Option<Vec<u8>>,
    pub(crate) usercode_jump: Option<[u8; JMP_REL32_SIZE]>,
    pub(crate) context: Context,
    pub(crate) installed: bool,
}

impl<F: Function> HookCore<F> {
    pub(crate) fn callback(&self) -> Option<&F::Callback> {
        self.callback.as_deref()
    }
}

/// A detour hook over a typed function target.
///
/// See the [module documentation](self) for the control flow. The
/// signature type parameter fixes the calling convention, argument list
/// and return handling at compile time.
#[repr(transparent)]
pub struct Hook<F: Function> {
    core: NonNull<HookCore<F>>,
    _owner: PhantomData<Box<HookCore<F>>>,
}

// SAFETY: the core is heap-pinned, only mutated through `&mut self`, and
// callbacks are required to be Send + Sync.
unsafe impl<F: Function> Send for Hook<F> {}
unsafe impl<F: Function> Sync for Hook<F> {}

impl<F: Function> Hook<F> {
    pub fn new() -> Hook<F> {
        let core = Box::new(HookCore {
            target: Address::NULL,
            callback: None,
            codecave: None,
            trampoline: Address::NULL,
            prologue_len: 0,
            original_prologue: None,
            usercode_jump: None,
            context: Context::default(),
            installed: false,
        });
        Hook {
            core: NonNull::from(Box::leak(core)),
            _owner: PhantomData,
        }
    }

    /// A hook over the code at `target`.
    pub fn with_target(target: Address) -> Hook<F> {
        let mut hook = Hook::new();
        hook.set_target(target);
        hook
    }

    /// A hook over the function `function` points to.
    pub fn with_function(function: F) -> Hook<F> {
        Hook::with_target(function.to_address())
    }

    /// A hook over `module` base plus `offset`.
    pub fn with_symbol(module: &Module, offset: usize) -> Hook<F> {
        Hook::with_target(module.at(offset))
    }

    fn core(&self) -> &HookCore<F> {
        unsafe { self.core.as_ref() }
    }

    pub fn target(&self) -> Address {
        self.core().target
    }

    /// Sets the target. Ignored while the hook is installed.
    pub fn set_target(&mut self, target: Address) {
        let core = unsafe { self.core.as_mut() };
        if core.installed {
            tracing::warn!("target change ignored on an installed hook");
            return;
        }
        core.target = target;
    }

    /// Routes the hooked function through `callback`.
    ///
    /// The callback receives the hook itself ahead of the original
    /// arguments and may call the original through [`Hook::call`]. Without
    /// a callback an installed hook is a transparent pass-through.
    pub fn redirect(&mut self, callback: Box<F::Callback>) {
        let core = unsafe { self.core.as_mut() };
        core.callback = Some(callback);
    }

    pub fn callback(&self) -> Option<&F::Callback> {
        self.core().callback()
    }

    pub fn installed(&self) -> bool {
        self.core().installed
    }

    /// Register snapshot taken at the most recent entry into the cave.
    pub fn context(&self) -> &Context {
        &self.core().context
    }

    /// Entry point of the trampoline ([`Hook::call`] goes through it).
    pub fn trampoline(&self) -> Address {
        self.core().trampoline
    }

    /// Patches the target prologue and routes it through this hook.
    ///
    /// # Safety
    /// The target must hold code of signature `F`, and nothing may execute
    /// it while the prologue is being rewritten.
    pub unsafe fn install(&mut self) -> Result<(), HookError> {
        let core_ptr = self.core.as_ptr();
        let core = &mut *core_ptr;

        if core.installed {
            return Err(HookError::AlreadyInstalled);
        }
        if !core.target.valid() {
            return Err(HookError::InvalidAddress);
        }
        if !protect::is_executable(core.target) {
            return Err(HookError::NotExecutable);
        }

        let disassembler = Disassembler::new();
        let Some(prologue) = disassembler.decode_prologue(core.target, JMP_REL32_SIZE) else {
            return Err(HookError::NotEnoughSpace);
        };
        if prologue.size < JMP_REL32_SIZE {
            return Err(HookError::NotEnoughSpace);
        }
        core.prologue_len = prologue.size;

        let guard =
            ScopedProtect::new(core.target, Protection::READ_WRITE_EXECUTE, prologue.size);
        if !guard.valid() {
            return Err(HookError::ProtectViolation);
        }

        if let Some(cave) = core.codecave.as_ref() {
            // re-install after a soft removal: the outer chain still
            // routes here, only the cave entry jump needs to come back
            let entry = cave.get();
            let Some(jump) = core.usercode_jump.take() else {
                return Err(HookError::ReinstallHook);
            };
            if ops::copy_unguarded(entry, Address::from_ptr(jump.as_ptr()), jump.len()).is_err() {
                core.usercode_jump = Some(jump);
                return Err(HookError::ReinstallHook);
            }
            core.installed = true;
            tracing::info!("re-installed hook at {}", core.target);
            return Ok(());
        }

        // first install: allocate the cave within rel32 range
        let cave = ScopedMemoryBlock::near(core.target, CODECAVE_SIZE);
        if !cave.allocated() {
            tracing::error!(
                "codecave allocation near {} failed: {:?}",
                core.target,
                cave.error()
            );
            return Err(HookError::AllocateCodecave);
        }
        let entry = cave.get();

        // snapshot the prologue before anything is rewritten
        let mut original = vec![0u8; prologue.size];
        if ops::copy_unguarded(
            Address::from_mut_ptr(original.as_mut_ptr()),
            core.target,
            original.len(),
        )
        .is_err()
        {
            return Err(HookError::BackupCreating);
        }

        let image = codecave::emit(&CaveLayout {
            target: core.target,
            prologue: &original,
            instructions: &prologue.instructions,
            entry,
            hook_ptr: core_ptr as usize,
            context: &core.context as *const Context as usize,
            relay: F::relay().value(),
            convention: F::CONVENTION,
            arity: F::ARITY,
            return_hidden_ptr: F::RETURN_HIDDEN_PTR,
        })?;
        if ops::copy_unguarded(entry, Address::from_ptr(image.as_ptr()), image.len()).is_err() {
            return Err(HookError::WriteMemory);
        }

        core.trampoline = entry + JMP_REL32_SIZE;
        core.original_prologue = Some(original);
        core.codecave = Some(cave);

        // route the target into the cave
        let first = disassembler.disassemble(core.target);
        let chained = first.len() == JMP_REL32_SIZE
            && (first.opcode() == OPCODE_CALL_REL32
                || first.opcode() & JMP_FAMILY_MASK == OPCODE_JMP_REL32)
            && first.is_relative_operand(0);

        let Ok(rel) = i32::try_from(entry - (core.target + JMP_REL32_SIZE)) else {
            rollback(core);
            return Err(HookError::WriteMemory);
        };

        if chained {
            // the prologue already belongs to another hook: keep its
            // opcode, reroute its displacement through this cave and call
            // on into the old chain head
            core.trampoline = first.abs(core.target, 0);
            if ops::write_unguarded::<i32>(core.target + 1, rel).is_err() {
                rollback(core);
                return Err(HookError::WriteMemory);
            }
        } else {
            if ops::write_unguarded::<u8>(core.target, OPCODE_JMP_REL32).is_err() {
                rollback(core);
                return Err(HookError::WriteMemory);
            }
            if ops::write_unguarded::<i32>(core.target + 1, rel).is_err() {
                rollback(core);
                return Err(HookError::WriteMemory);
            }
        }
        if prologue.size > JMP_REL32_SIZE
            && ops::fill_unguarded(
                core.target + JMP_REL32_SIZE,
                OPCODE_NOP,
                prologue.size - JMP_REL32_SIZE,
            )
            .is_err()
        {
            rollback(core);
            return Err(HookError::WriteMemory);
        }

        core.installed = true;
        tracing::info!(
            "installed hook at {} (codecave {}, prologue {} bytes)",
            core.target,
            entry,
            prologue.size
        );
        Ok(())
    }

    /// Unroutes the target from this hook.
    ///
    /// When this hook is the head of the target's chain the original
    /// prologue comes back and the cave is freed (hard removal). When an
    /// outer hook still routes through this cave, the cave entry is
    /// blanked instead so control falls through the trampoline into the
    /// original, and the cave stays allocated (soft removal).
    ///
    /// # Safety
    /// Nothing may execute the target while its prologue is rewritten.
    pub unsafe fn remove(&mut self) -> Result<(), HookError> {
        let core = self.core.as_mut();

        if !core.installed {
            return Err(HookError::AlreadyRemoved);
        }
        if !core.target.valid() {
            return Err(HookError::InvalidAddress);
        }

        let guard = ScopedProtect::new(
            core.target,
            Protection::READ_WRITE_EXECUTE,
            core.prologue_len,
        );
        if !guard.valid() {
            return Err(HookError::ProtectViolation);
        }

        // where does the target currently route?
        let first = Disassembler::new().disassemble(core.target);
        let mut destination = Address::NULL;
        for operand in 0..first.op_count() {
            if first.is_relative_operand(operand) {
                destination = first.abs(core.target, operand);
            }
        }

        let entry = core.codecave.as_ref().map(ScopedMemoryBlock::get).unwrap_or(Address::NULL);

        if destination == entry || destination == core.trampoline {
            // head of the chain: restore the prologue, drop the cave
            let Some(original) = core.original_prologue.take() else {
                return Err(HookError::BackupRestoring);
            };
            if ops::copy_unguarded(
                core.target,
                Address::from_ptr(original.as_ptr()),
                original.len(),
            )
            .is_err()
            {
                core.original_prologue = Some(original);
                return Err(HookError::BackupRestoring);
            }
            if let Some(mut cave) = core.codecave.take() {
                if let Err(error) = cave.free() {
                    tracing::error!("failed to release codecave at {entry}: {error}");
                    core.codecave = Some(cave);
                    return Err(HookError::DeallocateCodecave);
                }
            }
            core.usercode_jump = None;
            core.trampoline = Address::NULL;
            core.installed = false;
            tracing::info!("removed hook at {}", core.target);
        } else {
            // an outer hook still routes through this cave: keep it
            // allocated and blank the entry jump so the chain bypasses
            // this hook
            let mut jump = [0u8; JMP_REL32_SIZE];
            if ops::copy_unguarded(
                Address::from_mut_ptr(jump.as_mut_ptr()),
                entry,
                JMP_REL32_SIZE,
            )
            .is_err()
            {
                return Err(HookError::BackupCreating);
            }
            if ops::fill_unguarded(entry, OPCODE_NOP, JMP_REL32_SIZE).is_err() {
                return Err(HookError::UsercodeJumpRemove);
            }
            core.usercode_jump = Some(jump);
            core.installed = false;
            tracing::info!(
                "soft-removed hook at {} (an outer hook is still chained)",
                core.target
            );
        }
        Ok(())
    }
}

/// Undo a half-finished first install: prologue back, cave gone.
unsafe fn rollback<F: Function>(core: &mut HookCore<F>) {
    if let Some(original) = core.original_prologue.take() {
        let _ = ops::copy_unguarded(
            core.target,
            Address::from_ptr(original.as_ptr()),
            original.len(),
        );
    }
    if let Some(mut cave) = core.codecave.take() {
        let _ = cave.free();
    }
    core.trampoline = Address::NULL;
}

impl<F: Function> Default for Hook<F> {
    fn default() -> Self {
        Hook::new()
    }
}

impl<F: Function> Drop for Hook<F> {
    fn drop(&mut self) {
        if self.installed() {
            if let Err(error) = unsafe { self.remove() } {
                tracing::error!("failed to remove hook at {}: {error}", self.target());
            }
        }
        let mut core = unsafe { Box::from_raw(self.core.as_ptr()) };
        if core.installed || core.usercode_jump.is_some() {
            // the chain (or the target itself) still executes through
            // this cave: leak it rather than tear running code down
            if let Some(cave) = core.codecave.take() {
                let leaked = cave.into_raw();
                tracing::debug!("leaking codecave at {leaked} (still referenced)");
            }
        }
    }
}


#[cfg(all(test, target_arch = "x86"))]
mod tests {
    use super::*;

    fn init_logging() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Builds an executable target from hand-emitted machine code so the
    /// prologue byte layout is identical on every build.
    fn make_target(code: &[u8]) -> ScopedMemoryBlock {
        init_logging();
        let block = ScopedMemoryBlock::new(0x1000);
        assert!(block.allocated(), "target allocation failed");
        unsafe {
            ops::copy_unguarded(block.get(), Address::from_ptr(code.as_ptr()), code.len())
                .unwrap();
        }
        block
    }

    fn prologue_snapshot(address: Address, length: usize) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(address.as_ptr::<u8>(), length) }.to_vec()
    }

    #[test]
    fn test_cdecl_hook_doubles_sum() {
        // int sum(int a, int b) { return a + b; }
        let code = [
            0x90, 0x90, 0x90, // nop sled keeps the patch off the loads
            0x8b, 0x44, 0x24, 0x04, // mov eax, [esp + 4]
            0x03, 0x44, 0x24, 0x08, // add eax, [esp + 8]
            0xc3,
        ];
        let block = make_target(&code);
        let target = block.get();
        let before = prologue_snapshot(target, code.len());

        type SumFn = extern "cdecl" fn(i32, i32) -> i32;
        let sum: SumFn = unsafe { std::mem::transmute(target.value()) };
        assert_eq!(sum(2, 2), 4);

        let mut hook = Hook::<SumFn>::with_target(target);
        hook.redirect(Box::new(|hook, a, b| unsafe { hook.call(a, b) } * 2));
        unsafe {
            hook.install().unwrap();
        }
        assert_eq!(sum(2, 2), 8);

        unsafe {
            hook.remove().unwrap();
        }
        assert_eq!(sum(2, 2), 4);
        assert_eq!(prologue_snapshot(target, code.len()), before);
    }

    #[test]
    fn test_thiscall_pod_hook() {
        // int A::add(int a, int b): `this` in ECX, arguments on the
        // stack, callee cleans
        let code = [
            0x90, 0x90, 0x90,
            0x8b, 0x44, 0x24, 0x04, // mov eax, [esp + 4]
            0x03, 0x44, 0x24, 0x08, // add eax, [esp + 8]
            0xc2, 0x08, 0x00, // ret 8
        ];
        let block = make_target(&code);

        type AddFn = extern "thiscall" fn(usize, i32, i32) -> i32;
        let add: AddFn = unsafe { std::mem::transmute(block.get().value()) };
        let object = 0x1234usize;
        assert_eq!(add(object, 2, 2), 4);

        let mut hook = Hook::<AddFn>::with_target(block.get());
        hook.redirect(Box::new(|hook, this, a, b| {
            (unsafe { hook.call(this, a, b) }) * 2
        }));
        unsafe {
            hook.install().unwrap();
        }
        assert_eq!(add(object, 2, 2), 8);
        unsafe {
            hook.remove().unwrap();
        }
        assert_eq!(add(object, 2, 2), 4);
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Triple {
        p0: u32,
        p1: u32,
        p2: u32,
    }

    #[test]
    fn test_stdcall_non_pod_return() {
        // Triple make(a, b, c): twelve bytes travel through the hidden
        // return-slot pointer, the stack's first argument
        let code = [
            0x90, 0x90, 0x90,
            0x8b, 0x44, 0x24, 0x04, // mov eax, [esp + 4] - return slot
            0x8b, 0x4c, 0x24, 0x08, // mov ecx, [esp + 8]
            0x89, 0x08, // mov [eax], ecx
            0x8b, 0x4c, 0x24, 0x0c, // mov ecx, [esp + 12]
            0x89, 0x48, 0x04, // mov [eax + 4], ecx
            0x8b, 0x4c, 0x24, 0x10, // mov ecx, [esp + 16]
            0x89, 0x48, 0x08, // mov [eax + 8], ecx
            0xc2, 0x10, 0x00, // ret 16
        ];
        let block = make_target(&code);

        type MakeTripleFn = extern "stdcall" fn(u32, u32, u32) -> Triple;
        assert!(<MakeTripleFn as Function>::RETURN_HIDDEN_PTR);
        let make_triple: MakeTripleFn = unsafe { std::mem::transmute(block.get().value()) };
        assert_eq!(
            make_triple(1, 2, 3),
            Triple {
                p0: 1,
                p1: 2,
                p2: 3
            }
        );

        let mut hook = Hook::<MakeTripleFn>::with_target(block.get());
        hook.redirect(Box::new(|_hook, _a, _b, _c| Triple {
            p0: 0,
            p1: 0,
            p2: 0,
        }));
        unsafe {
            hook.install().unwrap();
        }
        assert_eq!(
            make_triple(1, 2, 3),
            Triple {
                p0: 0,
                p1: 0,
                p2: 0
            }
        );
        unsafe {
            hook.remove().unwrap();
        }
        assert_eq!(
            make_triple(1, 2, 3),
            Triple {
                p0: 1,
                p1: 2,
                p2: 3
            }
        );
    }

    #[test]
    fn test_fastcall_register_arguments() {
        // int sum3(a, b, c): a and b stay in ECX/EDX, c on the stack
        let code = [
            0x90, 0x90, 0x90,
            0x8d, 0x04, 0x0a, // lea eax, [edx + ecx]
            0x03, 0x44, 0x24, 0x04, // add eax, [esp + 4]
            0xc2, 0x04, 0x00, // ret 4
        ];
        let block = make_target(&code);

        type Sum3Fn = extern "fastcall" fn(i32, i32, i32) -> i32;
        let sum3: Sum3Fn = unsafe { std::mem::transmute(block.get().value()) };
        assert_eq!(sum3(1, 2, 3), 6);

        let mut hook = Hook::<Sum3Fn>::with_target(block.get());
        hook.redirect(Box::new(|hook, a, b, c| unsafe { hook.call(a, b, c) } * 2));
        unsafe {
            hook.install().unwrap();
        }
        assert_eq!(sum3(1, 2, 3), 12);
        unsafe {
            hook.remove().unwrap();
        }
        assert_eq!(sum3(1, 2, 3), 6);
    }
}
