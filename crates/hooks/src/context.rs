//! Register context captured at hook entry
//!
//! The codecave preamble snapshots the general-purpose registers and the
//! popped return address into the hook's [`Context`] before transferring
//! to the relay. Field order matches the preamble's store sequence; the
//! layout is `repr(C)` so the emitted stores can address fields by offset.
//!
//! The slot of the register the preamble itself uses to address the
//! context holds the context address instead of the register's entry
//! value.

/// Register snapshot, 64-bit hosts.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Return address popped off the stack by the preamble.
    pub return_address: u64,
}

/// Register snapshot, 32-bit hosts.
#[cfg(target_arch = "x86")]
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    /// Return address popped off the stack by the preamble.
    pub return_address: u32,
}

impl Context {
    /// The return address of the most recent entry through the codecave.
    pub fn return_address(&self) -> usize {
        self.return_address as usize
    }

    /// The stack pointer at hook entry (still including the return
    /// address slot).
    #[cfg(target_arch = "x86_64")]
    pub fn stack_pointer(&self) -> usize {
        self.rsp as usize
    }

    #[cfg(target_arch = "x86")]
    pub fn stack_pointer(&self) -> usize {
        self.esp as usize
    }
}
