//! Single-instruction decoder
//!
//! A thin wrapper over iced-x86 that decodes one instruction at a time and
//! answers the questions the hook engine asks: instruction length, operand
//! shapes, and absolute targets of relative branches. Also computes the
//! minimal whole-instruction prologue length a near jump needs.

use iced_x86::{Decoder, DecoderOptions, OpKind};

use detourkit_mem::Address;

/// Longest x86 instruction.
const MAX_INSTRUCTION_LEN: usize = 15;

/// A decoded instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    inner: iced_x86::Instruction,
    opcode: u8,
}

impl Instruction {
    /// Total length in bytes; zero when decoding failed.
    pub fn len(&self) -> usize {
        if self.inner.is_invalid() {
            0
        } else {
            self.inner.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First byte of the instruction encoding.
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn op_count(&self) -> usize {
        self.inner.op_count() as usize
    }

    pub fn is_register_operand(&self, operand: usize) -> bool {
        self.inner.op_kind(operand as u32) == OpKind::Register
    }

    pub fn is_memory_operand(&self, operand: usize) -> bool {
        self.inner.op_kind(operand as u32) == OpKind::Memory
    }

    pub fn is_immediate_operand(&self, operand: usize) -> bool {
        matches!(
            self.inner.op_kind(operand as u32),
            OpKind::Immediate8
                | OpKind::Immediate8_2nd
                | OpKind::Immediate16
                | OpKind::Immediate32
                | OpKind::Immediate64
                | OpKind::Immediate8to16
                | OpKind::Immediate8to32
                | OpKind::Immediate8to64
                | OpKind::Immediate32to64
        )
    }

    /// Whether the operand is a relative branch target.
    pub fn is_relative_operand(&self, operand: usize) -> bool {
        matches!(
            self.inner.op_kind(operand as u32),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
        )
    }

    /// Whether any memory operand is RIP-relative (64-bit only).
    pub fn is_rip_relative(&self) -> bool {
        self.inner.is_ip_rel_memory_operand()
    }

    pub fn imm8(&self) -> u8 {
        self.inner.immediate8()
    }

    pub fn imm16(&self) -> u16 {
        self.inner.immediate16()
    }

    pub fn imm32(&self) -> u32 {
        self.inner.immediate32()
    }

    pub fn imm64(&self) -> u64 {
        self.inner.immediate64()
    }

    /// Absolute destination of a relative branch operand, as if the
    /// instruction were located at `runtime_address`.
    pub fn abs(&self, runtime_address: Address, operand: usize) -> Address {
        if !self.is_relative_operand(operand) {
            return Address::NULL;
        }
        let decoded_at = self.inner.ip();
        let destination = self.inner.near_branch_target();
        let displacement = destination.wrapping_sub(decoded_at) as i64;
        Address::new(
            (runtime_address.value() as u64).wrapping_add(displacement as u64) as usize,
        )
    }
}

/// The decoded prologue of a function: whole instructions covering at
/// least the requested byte count.
#[derive(Debug, Clone)]
pub struct Prologue {
    pub instructions: Vec<Instruction>,
    pub size: usize,
}

/// A single-instruction decoder fixed to the host machine mode.
#[derive(Debug, Clone, Copy)]
pub struct Disassembler {
    bitness: u32,
}

impl Disassembler {
    pub fn new() -> Disassembler {
        Disassembler {
            bitness: if cfg!(target_pointer_width = "64") {
                64
            } else {
                32
            },
        }
    }

    /// Decodes the single instruction at `address`.
    ///
    /// # Safety
    /// At least [`MAX_INSTRUCTION_LEN`] bytes starting at `address` must be
    /// readable.
    pub unsafe fn disassemble(&self, address: Address) -> Instruction {
        let code = std::slice::from_raw_parts(address.as_ptr::<u8>(), MAX_INSTRUCTION_LEN);
        let mut decoder =
            Decoder::with_ip(self.bitness, code, address.value() as u64, DecoderOptions::NONE);
        Instruction {
            inner: decoder.decode(),
            opcode: code[0],
        }
    }

    /// Decodes whole instructions from `code` until at least `minimal`
    /// bytes are covered. Returns `None` when an instruction fails to
    /// decode first.
    ///
    /// # Safety
    /// See [`Disassembler::disassemble`].
    pub unsafe fn decode_prologue(&self, code: Address, minimal: usize) -> Option<Prologue> {
        let mut instructions = Vec::new();
        let mut size = 0;
        while size < minimal {
            let instruction = self.disassemble(code + size);
            if instruction.is_empty() {
                return None;
            }
            size += instruction.len();
            instructions.push(instruction);
        }
        Some(Prologue { instructions, size })
    }

    /// The minimal whole-instruction byte count at `code` that is at least
    /// `minimal`, or zero when the walk hits an undecodable instruction.
    ///
    /// # Safety
    /// See [`Disassembler::disassemble`].
    pub unsafe fn prologue_length(&self, code: Address, minimal: usize) -> usize {
        self.decode_prologue(code, minimal)
            .map_or(0, |prologue| prologue.size)
    }
}

impl Default for Disassembler {
    fn default() -> Self {
        Disassembler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(code: &[u8]) -> Instruction {
        let mut padded = code.to_vec();
        padded.resize(MAX_INSTRUCTION_LEN, 0x90);
        unsafe { Disassembler::new().disassemble(Address::from_ptr(padded.as_ptr())) }
    }

    #[test]
    fn test_nop() {
        let instruction = decode(&[0x90]);
        assert_eq!(instruction.len(), 1);
        assert_eq!(instruction.opcode(), 0x90);
        assert_eq!(instruction.op_count(), 0);
    }

    #[test]
    fn test_mov_imm() {
        // mov eax, 0x11223344
        let instruction = decode(&[0xb8, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(instruction.len(), 5);
        assert!(instruction.is_register_operand(0));
        assert!(instruction.is_immediate_operand(1));
        assert_eq!(instruction.imm32(), 0x1122_3344);
    }

    #[test]
    fn test_near_jmp_abs() {
        // jmp +0x10 relative to the end of the instruction
        let code = [0xe9, 0x10, 0x00, 0x00, 0x00];
        let instruction = decode(&code);
        assert_eq!(instruction.len(), 5);
        assert!(instruction.is_relative_operand(0));
        let runtime = Address::new(0x40_0000);
        assert_eq!(instruction.abs(runtime, 0), runtime + 5 + 0x10);
    }

    #[test]
    fn test_near_call_backward() {
        // call -0x20
        let code = [0xe8, 0xe0, 0xff, 0xff, 0xff];
        let instruction = decode(&code);
        assert_eq!(instruction.opcode(), 0xe8);
        let runtime = Address::new(0x40_0000);
        assert_eq!(instruction.abs(runtime, 0), runtime + 5 - 0x20);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_prologue_length_accumulates_whole_instructions() {
        // push rbp; mov rbp, rsp; mov eax, 1  (1 + 3 + 5 bytes)
        let code = [0x55, 0x48, 0x89, 0xe5, 0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3];
        let mut padded = code.to_vec();
        padded.resize(32, 0x90);
        let disassembler = Disassembler::new();
        let address = Address::from_ptr(padded.as_ptr());
        unsafe {
            assert_eq!(disassembler.prologue_length(address, 5), 9);
            assert_eq!(disassembler.prologue_length(address, 1), 1);
            assert_eq!(disassembler.prologue_length(address, 4), 4);
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_rip_relative_detection() {
        // mov rax, [rip+0x10]
        let instruction = decode(&[0x48, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00]);
        assert!(instruction.is_rip_relative());
    }
}
