//! Codecave emission
//!
//! Builds the per-hook executable buffer: a leading jump over the
//! trampoline into the relay preamble, the rewritten copy of the target
//! prologue with its jump back into the body, and the preamble itself,
//! which snapshots registers, inserts the hook pointer into the argument
//! list and transfers to the relay.
//!
//! Layout, from the cave base:
//!
//! ```text
//! entry:      E9 rel32            ; over the trampoline, to the preamble
//! trampoline: <rewritten prologue copy>
//!             E9 rel32            ; back to target + L
//! preamble:   <context save, argument insertion, relay transfer>
//! ```

use detourkit_mem::Address;

use crate::context::Context;
use crate::convention::CallingConvention;
use crate::disasm::Instruction;
use crate::error::HookError;

pub(crate) const OPCODE_CALL_REL32: u8 = 0xe8;
pub(crate) const OPCODE_JMP_REL32: u8 = 0xe9;
pub(crate) const OPCODE_JMP_REL8: u8 = 0xeb;
pub(crate) const OPCODE_NOP: u8 = 0x90;
/// Groups the near/short unconditional jump opcodes (E9, EB).
pub(crate) const JMP_FAMILY_MASK: u8 = 0xfd;
/// Size of a `E9 rel32` / `E8 rel32` instruction.
pub(crate) const JMP_REL32_SIZE: usize = 5;
/// One page holds every layout this engine emits.
pub(crate) const CODECAVE_SIZE: usize = 4096;

/// Everything the emitter needs to lay out one hook's cave.
pub(crate) struct CaveLayout<'a> {
    pub target: Address,
    /// Snapshot of the first *L* bytes at the target.
    pub prologue: &'a [u8],
    /// The decoded instructions covering `prologue`.
    pub instructions: &'a [Instruction],
    /// Cave base address.
    pub entry: Address,
    /// Address of the owning hook state, embedded as the relay's leading
    /// argument.
    pub hook_ptr: usize,
    /// Address of the hook's register context.
    pub context: usize,
    /// Address of the per-signature relay thunk.
    pub relay: usize,
    pub convention: CallingConvention,
    pub arity: usize,
    pub return_hidden_ptr: bool,
}

/// Signed 32-bit displacement from the end of a rel32 instruction.
fn displacement(destination: Address, next_instruction: Address) -> Result<i32, HookError> {
    i32::try_from(destination - next_instruction).map_err(|_| HookError::NotEnoughSpace)
}

/// Copies the prologue instructions, rewriting the near CALL/JMP family
/// and refusing anything else that is position-dependent.
fn rewrite_prologue(layout: &CaveLayout) -> Result<Vec<u8>, HookError> {
    let trampoline_base = layout.entry + JMP_REL32_SIZE;
    let mut out = Vec::with_capacity(layout.prologue.len() + JMP_REL32_SIZE);
    let mut offset = 0usize;

    for instruction in layout.instructions {
        let length = instruction.len();
        let bytes = &layout.prologue[offset..offset + length];
        let opcode = instruction.opcode();
        let relative =
            (0..instruction.op_count()).any(|operand| instruction.is_relative_operand(operand));
        let location = trampoline_base + out.len();

        if opcode == OPCODE_CALL_REL32 && relative && length == JMP_REL32_SIZE {
            let destination = instruction.abs(layout.target + offset, 0);
            out.push(OPCODE_CALL_REL32);
            out.extend_from_slice(
                &displacement(destination, location + JMP_REL32_SIZE)?.to_le_bytes(),
            );
        } else if opcode & JMP_FAMILY_MASK == OPCODE_JMP_REL32 && relative {
            if opcode == OPCODE_JMP_REL8 && cfg!(target_arch = "x86_64") {
                // short jumps are not relocated on 64-bit hosts
                return Err(HookError::NotEnoughSpace);
            }
            // near jump, or a short jump widened to the rel32 form
            let destination = instruction.abs(layout.target + offset, 0);
            out.push(OPCODE_JMP_REL32);
            out.extend_from_slice(
                &displacement(destination, location + JMP_REL32_SIZE)?.to_le_bytes(),
            );
        } else if relative {
            // conditional and LOOP-family branches would break when moved
            return Err(HookError::NotEnoughSpace);
        } else if cfg!(target_arch = "x86_64") && instruction.is_rip_relative() {
            return Err(HookError::NotEnoughSpace);
        } else {
            out.extend_from_slice(bytes);
        }
        offset += length;
    }

    // back into the body past the patched bytes
    let location = trampoline_base + out.len();
    out.push(OPCODE_JMP_REL32);
    out.extend_from_slice(
        &displacement(
            layout.target + layout.prologue.len(),
            location + JMP_REL32_SIZE,
        )?
        .to_le_bytes(),
    );
    Ok(out)
}

/// Emits the complete cave image.
pub(crate) fn emit(layout: &CaveLayout) -> Result<Vec<u8>, HookError> {
    let trampoline = rewrite_prologue(layout)?;

    let mut code = Vec::with_capacity(trampoline.len() + 256);
    code.push(OPCODE_JMP_REL32);
    code.extend_from_slice(&(trampoline.len() as i32).to_le_bytes());
    code.extend_from_slice(&trampoline);

    emit_preamble(&mut code, layout)?;

    if code.len() > CODECAVE_SIZE {
        return Err(HookError::NotEnoughSpace);
    }
    Ok(code)
}

#[cfg(target_arch = "x86_64")]
use preamble64::emit_preamble;
#[cfg(target_arch = "x86")]
use preamble32::emit_preamble;

#[cfg(target_arch = "x86_64")]
mod preamble64 {
    use super::*;

    // register numbers as encoded in ModRM
    const RAX: u8 = 0;
    const RCX: u8 = 1;
    const RDX: u8 = 2;
    const RBX: u8 = 3;
    const RSP: u8 = 4;
    const RBP: u8 = 5;
    const RSI: u8 = 6;
    const RDI: u8 = 7;
    const R8: u8 = 8;
    const R9: u8 = 9;
    const R10: u8 = 10;
    const R11: u8 = 11;
    const R12: u8 = 12;
    const R13: u8 = 13;
    const R14: u8 = 14;
    const R15: u8 = 15;

    fn movabs(code: &mut Vec<u8>, reg: u8, value: u64) {
        code.push(0x48 | u8::from(reg >= 8));
        code.push(0xb8 + (reg & 7));
        code.extend_from_slice(&value.to_le_bytes());
    }

    /// mov [r11 + disp], reg
    fn store_to_context(code: &mut Vec<u8>, disp: usize, reg: u8) {
        code.push(0x49 | (u8::from(reg >= 8) << 2));
        code.push(0x89);
        if disp < 0x80 {
            code.push(0x40 | ((reg & 7) << 3) | 0x03);
            code.push(disp as u8);
        } else {
            code.push(0x80 | ((reg & 7) << 3) | 0x03);
            code.extend_from_slice(&(disp as u32).to_le_bytes());
        }
    }

    /// mov dst, src
    fn mov_reg(code: &mut Vec<u8>, dst: u8, src: u8) {
        code.push(0x48 | (u8::from(src >= 8) << 2) | u8::from(dst >= 8));
        code.push(0x89);
        code.push(0xc0 | ((src & 7) << 3) | (dst & 7));
    }

    fn push_reg(code: &mut Vec<u8>, reg: u8) {
        if reg >= 8 {
            code.push(0x41);
        }
        code.push(0x50 + (reg & 7));
    }

    /// push qword [r10 + disp]
    fn push_from_r10(code: &mut Vec<u8>, disp: usize) {
        code.push(0x41);
        code.push(0xff);
        if disp < 0x80 {
            code.push(0x72);
            code.push(disp as u8);
        } else {
            code.push(0xb2);
            code.extend_from_slice(&(disp as u32).to_le_bytes());
        }
    }

    fn add_rsp(code: &mut Vec<u8>, amount: usize) {
        if amount == 0 {
            return;
        }
        if amount < 0x80 {
            code.extend_from_slice(&[0x48, 0x83, 0xc4, amount as u8]);
        } else {
            code.extend_from_slice(&[0x48, 0x81, 0xc4]);
            code.extend_from_slice(&(amount as u32).to_le_bytes());
        }
    }

    fn sub_rsp(code: &mut Vec<u8>, amount: usize) {
        if amount == 0 {
            return;
        }
        if amount < 0x80 {
            code.extend_from_slice(&[0x48, 0x83, 0xec, amount as u8]);
        } else {
            code.extend_from_slice(&[0x48, 0x81, 0xec]);
            code.extend_from_slice(&(amount as u32).to_le_bytes());
        }
    }

    pub(super) fn emit_preamble(
        code: &mut Vec<u8>,
        layout: &CaveLayout,
    ) -> Result<(), HookError> {
        let context = layout.context as u64;
        let (argument_registers, shadow): (&[u8], usize) = match layout.convention {
            CallingConvention::Win64 => (&[RCX, RDX, R8, R9], 32),
            CallingConvention::Sysv64 => (&[RDI, RSI, RDX, RCX, R8, R9], 0),
            _ => unreachable!("32-bit convention on a 64-bit host"),
        };

        // r11 addresses the context for the snapshot; its own slot keeps
        // the context address rather than the entry value
        movabs(code, R11, context);
        let stores: [(usize, u8); 15] = [
            (std::mem::offset_of!(Context, rax), RAX),
            (std::mem::offset_of!(Context, rbx), RBX),
            (std::mem::offset_of!(Context, rcx), RCX),
            (std::mem::offset_of!(Context, rdx), RDX),
            (std::mem::offset_of!(Context, rsi), RSI),
            (std::mem::offset_of!(Context, rdi), RDI),
            (std::mem::offset_of!(Context, rbp), RBP),
            (std::mem::offset_of!(Context, rsp), RSP),
            (std::mem::offset_of!(Context, r8), R8),
            (std::mem::offset_of!(Context, r9), R9),
            (std::mem::offset_of!(Context, r10), R10),
            (std::mem::offset_of!(Context, r12), R12),
            (std::mem::offset_of!(Context, r13), R13),
            (std::mem::offset_of!(Context, r14), R14),
            (std::mem::offset_of!(Context, r15), R15),
        ];
        for (disp, reg) in stores {
            store_to_context(code, disp, reg);
        }

        // pop the return address into the context
        code.extend_from_slice(&[0x4c, 0x8b, 0x14, 0x24]); // mov r10, [rsp]
        store_to_context(code, std::mem::offset_of!(Context, return_address), R10);
        add_rsp(code, 8);

        let lead = usize::from(layout.return_hidden_ptr);
        let register_count = argument_registers.len();
        let target_slots = lead + layout.arity;
        let relay_slots = target_slots + 1;
        let spilled = relay_slots.saturating_sub(register_count);
        let padding = if spilled % 2 == 1 { 8 } else { 0 };

        if spilled > 0 {
            // r10 pins the base of the target's stack arguments before
            // any pushes move rsp
            // lea r10, [rsp + shadow]
            code.extend_from_slice(&[0x4c, 0x8d, 0x54, 0x24, shadow as u8]);
            sub_rsp(code, padding);
            for slot in (register_count..relay_slots).rev() {
                let source = slot - 1;
                if source >= register_count {
                    push_from_r10(code, 8 * (source - register_count));
                } else {
                    push_reg(code, argument_registers[source]);
                }
            }
        }
        sub_rsp(code, shadow);

        // shift the register arguments one slot up, then plant the hook
        // pointer in the freed slot
        let highest = relay_slots.min(register_count);
        for slot in (lead + 1..highest).rev() {
            mov_reg(code, argument_registers[slot], argument_registers[slot - 1]);
        }
        movabs(code, argument_registers[lead], layout.hook_ptr as u64);

        // call the relay, free what was inserted, resume at the caller
        movabs(code, R11, layout.relay as u64);
        code.extend_from_slice(&[0x41, 0xff, 0xd3]); // call r11
        add_rsp(code, shadow + 8 * spilled + padding);
        movabs(
            code,
            R10,
            context + std::mem::offset_of!(Context, return_address) as u64,
        );
        code.extend_from_slice(&[0x4d, 0x8b, 0x12]); // mov r10, [r10]
        code.extend_from_slice(&[0x41, 0xff, 0xe2]); // jmp r10
        Ok(())
    }
}

#[cfg(target_arch = "x86")]
mod preamble32 {
    use super::*;

    const EAX: u8 = 0;
    const ECX: u8 = 1;
    const EDX: u8 = 2;
    const EBX: u8 = 3;
    const ESP: u8 = 4;
    const EBP: u8 = 5;
    const ESI: u8 = 6;
    const EDI: u8 = 7;

    /// mov [disp32], reg
    fn store_to_context(code: &mut Vec<u8>, address: u32, reg: u8) {
        code.push(0x89);
        code.push((reg << 3) | 0x05);
        code.extend_from_slice(&address.to_le_bytes());
    }

    fn push_imm32(code: &mut Vec<u8>, value: u32) {
        code.push(0x68);
        code.extend_from_slice(&value.to_le_bytes());
    }

    pub(super) fn emit_preamble(
        code: &mut Vec<u8>,
        layout: &CaveLayout,
    ) -> Result<(), HookError> {
        let context = layout.context as u32;
        let return_slot = context + std::mem::offset_of!(Context, return_address) as u32;

        let stores: [(usize, u8); 8] = [
            (std::mem::offset_of!(Context, eax), EAX),
            (std::mem::offset_of!(Context, ecx), ECX),
            (std::mem::offset_of!(Context, edx), EDX),
            (std::mem::offset_of!(Context, ebx), EBX),
            (std::mem::offset_of!(Context, esp), ESP),
            (std::mem::offset_of!(Context, ebp), EBP),
            (std::mem::offset_of!(Context, esi), ESI),
            (std::mem::offset_of!(Context, edi), EDI),
        ];
        for (disp, reg) in stores {
            store_to_context(code, context + disp as u32, reg);
        }

        // pop the return address into the context
        code.extend_from_slice(&[0x8f, 0x05]);
        code.extend_from_slice(&return_slot.to_le_bytes());

        if layout.return_hidden_ptr {
            // hidden return-slot pointer off the stack before the hook
            // pointer goes in
            code.push(0x58); // pop eax
        }

        match layout.convention {
            CallingConvention::Cdecl | CallingConvention::Stdcall => {
                push_imm32(code, layout.hook_ptr as u32);
            }
            CallingConvention::Thiscall => {
                code.push(0x51); // push ecx - the original `this`
                push_imm32(code, layout.hook_ptr as u32);
            }
            CallingConvention::Fastcall => {
                // the wrapped hook pointer is the relay's first stack
                // argument; ECX and EDX stay with the original arguments
                push_imm32(code, layout.hook_ptr as u32);
            }
            _ => unreachable!("64-bit convention on a 32-bit host"),
        }

        if layout.return_hidden_ptr {
            code.push(0x50); // push eax - hidden pointer back on top
        }

        if layout.convention.caller_cleans() {
            // call relay; free the inserted hook pointer; resume at the
            // caller
            let location = layout.entry + code.len();
            code.push(OPCODE_CALL_REL32);
            code.extend_from_slice(
                &displacement(Address::new(layout.relay), location + JMP_REL32_SIZE)?
                    .to_le_bytes(),
            );
            code.extend_from_slice(&[0x83, 0xc4, 0x04]); // add esp, 4
            code.extend_from_slice(&[0xff, 0x25]); // jmp [return_slot]
            code.extend_from_slice(&return_slot.to_le_bytes());
        } else {
            // callee cleanup: the relay's own return frees everything,
            // including the inserted hook pointer
            code.extend_from_slice(&[0xff, 0x35]); // push [return_slot]
            code.extend_from_slice(&return_slot.to_le_bytes());
            let location = layout.entry + code.len();
            code.push(OPCODE_JMP_REL32);
            code.extend_from_slice(
                &displacement(Address::new(layout.relay), location + JMP_REL32_SIZE)?
                    .to_le_bytes(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::Disassembler;

    #[cfg(target_arch = "x86_64")]
    fn layout_for<'a>(
        prologue: &'a [u8],
        instructions: &'a [Instruction],
        target: Address,
        entry: Address,
    ) -> CaveLayout<'a> {
        CaveLayout {
            target,
            prologue,
            instructions,
            entry,
            hook_ptr: 0x1000_0000,
            context: 0x2000_0000,
            relay: 0x3000_0000,
            convention: if cfg!(windows) {
                CallingConvention::Win64
            } else {
                CallingConvention::Sysv64
            },
            arity: 2,
            return_hidden_ptr: false,
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_trampoline_copies_plain_instructions() {
        // nop; nop; nop; lea eax, [rdi + rsi]
        let prologue = [0x90u8, 0x90, 0x90, 0x8d, 0x04, 0x37];
        let mut padded = prologue.to_vec();
        padded.resize(32, 0xc3);
        let target = Address::from_ptr(padded.as_ptr());
        let decoded = unsafe {
            Disassembler::new()
                .decode_prologue(target, JMP_REL32_SIZE)
                .unwrap()
        };
        assert_eq!(decoded.size, 6);

        let entry = target + 0x800; // nearby fake cave
        let layout = layout_for(&prologue, &decoded.instructions, target, entry);
        let trampoline = rewrite_prologue(&layout).unwrap();

        // verbatim copy plus the jump back
        assert_eq!(&trampoline[..6], &prologue[..]);
        assert_eq!(trampoline[6], OPCODE_JMP_REL32);
        assert_eq!(trampoline.len(), 6 + JMP_REL32_SIZE);

        // the jump resolves to target + L
        let rel = i32::from_le_bytes(trampoline[7..11].try_into().unwrap());
        let jmp_end = entry + JMP_REL32_SIZE + 6 + JMP_REL32_SIZE;
        assert_eq!(
            jmp_end.value().wrapping_add(rel as usize),
            (target + 6).value()
        );
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_trampoline_rewrites_leading_call() {
        // call +0x100; then padding
        let mut code = vec![0xe8u8, 0x00, 0x01, 0x00, 0x00];
        code.resize(32, 0x90);
        let target = Address::from_ptr(code.as_ptr());
        let decoded = unsafe {
            Disassembler::new()
                .decode_prologue(target, JMP_REL32_SIZE)
                .unwrap()
        };
        let callee = target + 5 + 0x100;

        let entry = target + 0x800; // nearby fake cave
        let layout = layout_for(&code[..5], &decoded.instructions, target, entry);
        let trampoline = rewrite_prologue(&layout).unwrap();

        assert_eq!(trampoline[0], OPCODE_CALL_REL32);
        let rel = i32::from_le_bytes(trampoline[1..5].try_into().unwrap());
        let call_end = entry + JMP_REL32_SIZE + JMP_REL32_SIZE;
        assert_eq!(
            call_end.value().wrapping_add(rel as usize),
            callee.value()
        );
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_trampoline_refuses_short_jump() {
        // jmp short +2; nop sled
        let mut code = vec![0xebu8, 0x02];
        code.resize(32, 0x90);
        let target = Address::from_ptr(code.as_ptr());
        let decoded = unsafe {
            Disassembler::new()
                .decode_prologue(target, JMP_REL32_SIZE)
                .unwrap()
        };
        let layout = layout_for(&code[..decoded.size], &decoded.instructions, target, target + 0x800);
        assert_eq!(
            rewrite_prologue(&layout).unwrap_err(),
            HookError::NotEnoughSpace
        );
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_trampoline_refuses_rip_relative() {
        // mov rax, [rip + 0x10]; nop sled
        let mut code = vec![0x48u8, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00];
        code.resize(32, 0x90);
        let target = Address::from_ptr(code.as_ptr());
        let decoded = unsafe {
            Disassembler::new()
                .decode_prologue(target, JMP_REL32_SIZE)
                .unwrap()
        };
        let layout = layout_for(&code[..decoded.size], &decoded.instructions, target, target + 0x800);
        assert_eq!(
            rewrite_prologue(&layout).unwrap_err(),
            HookError::NotEnoughSpace
        );
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_cave_starts_with_entry_jump_over_trampoline() {
        let prologue = [0x90u8, 0x90, 0x90, 0x90, 0x90];
        let mut padded = prologue.to_vec();
        padded.resize(32, 0xc3);
        let target = Address::from_ptr(padded.as_ptr());
        let decoded = unsafe {
            Disassembler::new()
                .decode_prologue(target, JMP_REL32_SIZE)
                .unwrap()
        };
        let layout = layout_for(&prologue, &decoded.instructions, target, target + 0x800);
        let cave = emit(&layout).unwrap();

        assert_eq!(cave[0], OPCODE_JMP_REL32);
        let rel = i32::from_le_bytes(cave[1..5].try_into().unwrap());
        // entry jump lands right after the trampoline copy and its jump
        assert_eq!(rel as usize, prologue.len() + JMP_REL32_SIZE);
        assert!(cave.len() <= CODECAVE_SIZE);
    }
}
