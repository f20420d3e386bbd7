use crate::{*, error::*, memory::*};
use gimli::RunTimeEndian;
use std::{mem, fmt};

#[derive(Clone)]
pub struct Registers {
    pub ints: [u64; RegisterIdx::INT_COUNT],
    // Can add floating-point and vector registers similarly. Probably use shared indexing, with ranges corresponding to types.

    // Bitmask saying which values are populated in the array(s) above (including dubious values).
    pub mask: u64,
    // Which of the values are just guesses.
    pub dubious_mask: u64,
}

#[repr(u8)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub enum RegisterIdx {
    // x86-64 registers, in DWARF numbering order.
    Rax = 0,
    Rdx = 1,
    Rcx = 2,
    Rbx = 3,
    Rsi = 4,
    Rdi = 5,
    Rbp = 6,
    Rsp = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
    Rip = 16,
    Cs = 17,
    Ss = 18,
    Fs = 19,
    Gs = 20,
    FsBase = 21,
    GsBase = 22,
    Flags = 23,
}

impl RegisterIdx {
    pub const INT_COUNT: usize = RegisterIdx::Flags as usize + 1;
    pub const TOTAL_COUNT: usize = RegisterIdx::Flags as usize + 1;

    pub fn from_dwarf(r: gimli::Register) -> Option<RegisterIdx> {
        match r.0 {
            0..=16 => Some(unsafe {mem::transmute(r.0 as u8)}),
            49 => Some(RegisterIdx::Flags),
            51 => Some(RegisterIdx::Cs),
            52 => Some(RegisterIdx::Ss),
            54 => Some(RegisterIdx::Fs),
            55 => Some(RegisterIdx::Gs),
            58 => Some(RegisterIdx::FsBase),
            59 => Some(RegisterIdx::GsBase),
            _ => None,
        }
    }

    pub fn all() -> &'static [RegisterIdx] {
        &REGISTER_IDXS
    }

    pub fn name(self) -> &'static str {
        REGISTER_NAMES[self as usize]
    }

    pub fn parse_ignore_case(s: &str) -> Option<Self> {
        REGISTER_NAMES.iter().position(|n| n.eq_ignore_ascii_case(s)).map(|i| unsafe {mem::transmute(i as u8)})
    }
}

pub const REGISTER_IDXS: [RegisterIdx; RegisterIdx::TOTAL_COUNT] = [RegisterIdx::Rax, RegisterIdx::Rdx, RegisterIdx::Rcx, RegisterIdx::Rbx, RegisterIdx::Rsi, RegisterIdx::Rdi, RegisterIdx::Rbp, RegisterIdx::Rsp, RegisterIdx::R8, RegisterIdx::R9, RegisterIdx::R10, RegisterIdx::R11, RegisterIdx::R12, RegisterIdx::R13, RegisterIdx::R14, RegisterIdx::R15, RegisterIdx::Rip, RegisterIdx::Cs, RegisterIdx::Ss, RegisterIdx::Fs, RegisterIdx::Gs, RegisterIdx::FsBase, RegisterIdx::GsBase, RegisterIdx::Flags];
pub const REGISTER_NAMES: [&'static str; RegisterIdx::TOTAL_COUNT] = ["rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15", "rip", "cs", "ss", "fs", "gs", "fs_base", "gs_base", "flags"];

// Description of one register slot in the argument struct: which register, and how many bytes
// the compiled code expects. Integer registers are 8 bytes wide; a disagreeing byte_size is
// caught at materialization time.
#[derive(Clone, Copy, Debug)]
pub struct RegisterInfo {
    pub reg: RegisterIdx,
    pub byte_size: usize,
}

impl RegisterInfo {
    pub fn new(reg: RegisterIdx) -> RegisterInfo {
        RegisterInfo {reg, byte_size: 8}
    }
}

// A register's bytes, in a specific byte order. Integer registers fit in 8 bytes.
pub struct RegisterValue {
    bytes: [u8; 8],
    byte_size: usize,
}

impl RegisterValue {
    pub fn as_slice(&self) -> &[u8] { &self.bytes[..self.byte_size] }
    pub fn byte_size(&self) -> usize { self.byte_size }
}

impl Registers {
    pub fn set_int(&mut self, reg: RegisterIdx, val: u64, dubious: bool) {
        self.ints[reg as usize] = val;
        self.mask |= 1u64 << (reg as u32);
        if dubious {
            self.dubious_mask |= 1u64 << (reg as u32);
        }
    }

    pub fn has(&self, reg: RegisterIdx) -> bool {
        self.mask & (1u64 << reg as u32) != 0
    }

    pub fn is_dubious(&self, reg: RegisterIdx) -> bool {
        self.dubious_mask & (1u64 << reg as u32) != 0
    }

    pub fn get_int(&self, reg: RegisterIdx) -> Result<(u64, /*dubious*/ bool)> {
        if self.mask & (1u64 << reg as u32) == 0 {
            err!(ReadFailed, "no {} in this frame", reg)
        } else {
            Ok((self.ints[reg as usize], self.is_dubious(reg)))
        }
    }

    // Returns the register at its natural width (8 bytes for the integer bank), regardless
    // of what byte_size the caller's RegisterInfo claims. The caller compares.
    pub fn read_register(&self, info: &RegisterInfo, endian: RunTimeEndian) -> Result<RegisterValue> {
        let (val, _dubious) = self.get_int(info.reg)?;
        let mut r = RegisterValue {bytes: [0; 8], byte_size: 8};
        scalar_to_bytes(val, &mut r.bytes, endian);
        Ok(r)
    }

    // Replaces the low byte_size bytes of the 64-bit slot; the rest of the register keeps
    // its previous value (the bank is written back to the inferior whole-register).
    pub fn write_register(&mut self, info: &RegisterInfo, data: &[u8], endian: RunTimeEndian) -> Result<()> {
        if data.len() < info.byte_size {
            return err!(SizeMismatch, "data for register {} had size {} but we expected {}", info.reg, data.len(), info.byte_size);
        }
        let val = scalar_from_bytes(&data[..info.byte_size], endian);
        let merged = if info.byte_size >= 8 {
            val
        } else {
            let (old, _) = self.get_int(info.reg).unwrap_or((0, false));
            let keep = !((1u64 << (info.byte_size as u32 * 8)) - 1);
            (old & keep) | val
        };
        self.set_int(info.reg, merged, false);
        Ok(())
    }
}

impl Default for Registers {
    fn default() -> Self {
        Registers {ints: [0; RegisterIdx::INT_COUNT], mask: 0, dubious_mask: 0}
    }
}

impl fmt::Display for RegisterIdx {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", REGISTER_NAMES[*self as usize])
    }
}
