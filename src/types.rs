use bitflags::*;

bitflags! { pub struct TypeFlags: u8 {
    const REFERENCE = 0x1;
}}

// The few facts about a user-visible type that argument staging needs. The full type graph
// (fields, templates, typedef chains) stays in the symbols subsystem; entities only care
// about size, alignment and reference-ness.
#[derive(Clone, Debug)]
pub struct TypeDesc {
    pub name: String,
    pub byte_size: usize,
    pub bit_alignment: usize,
    pub flags: TypeFlags,
}

impl TypeDesc {
    pub fn new(name: &str, byte_size: usize, bit_alignment: usize) -> TypeDesc {
        TypeDesc {name: name.to_string(), byte_size, bit_alignment, flags: TypeFlags::empty()}
    }

    pub fn reference(name: &str, byte_size: usize, bit_alignment: usize) -> TypeDesc {
        TypeDesc {name: name.to_string(), byte_size, bit_alignment, flags: TypeFlags::REFERENCE}
    }

    pub fn is_reference(&self) -> bool { self.flags.contains(TypeFlags::REFERENCE) }

    pub fn byte_alignment(&self) -> usize { (self.bit_alignment + 7) / 8 }
}
