use crate::{*, error::*, context::*, value::*};
use bitflags::*;
use gimli::{RunTimeEndian, Endianity};
use std::{rc::Rc, cell::RefCell};

pub const INVALID_ADDRESS: usize = usize::MAX;

bitflags! { pub struct Permissions: u8 {
    const READABLE = 0x1;
    const WRITABLE = 0x2;
    const EXECUTABLE = 0x4;
}}

impl Permissions {
    pub fn rw() -> Permissions { Permissions::READABLE | Permissions::WRITABLE }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocationPolicy {
    // Allocation exists only on the debugger side.
    HostOnly,
    // Allocated in the inferior, and the map keeps a shadow copy on the debugger side.
    Mirror,
    // Allocated in the inferior only.
    Process,
}

// The slice of the expression-execution memory map that this subsystem needs. The real
// implementation sits on top of the process (ptrace or a core dump) plus a host-side
// allocator; entities only see these operations.
pub trait MemoryMap {
    fn malloc(&mut self, size: usize, alignment: usize, permissions: Permissions, policy: AllocationPolicy) -> Result<usize>;
    fn free(&mut self, address: usize) -> Result<()>;
    fn read_memory(&mut self, buf: &mut [u8], address: usize) -> Result<()>;
    fn write_memory(&mut self, address: usize, buf: &[u8]) -> Result<()>;
    fn best_execution_scope(&self) -> Option<ExecutionScope>;
    fn byte_order(&self) -> RunTimeEndian;
    fn address_byte_size(&self) -> usize;

    fn read_pointer(&mut self, address: usize) -> Result<usize> {
        let addr_size = self.address_byte_size();
        let mut buf = [0u8; 8];
        self.read_memory(&mut buf[..addr_size], address)?;
        Ok(scalar_from_bytes(&buf[..addr_size], self.byte_order()) as usize)
    }

    fn write_pointer(&mut self, address: usize, ptr: usize) -> Result<()> {
        let addr_size = self.address_byte_size();
        self.write_scalar(address, ptr as u64, addr_size)
    }

    fn write_scalar(&mut self, address: usize, value: u64, byte_count: usize) -> Result<()> {
        let mut buf = [0u8; 8];
        scalar_to_bytes(value, &mut buf[..byte_count], self.byte_order());
        self.write_memory(address, &buf[..byte_count])
    }

    // Read that also pins down the byte order of the result (the map's own).
    fn read_data(&mut self, address: usize, size: usize) -> Result<ValueBlob> {
        let mut blob = ValueBlob::with_capacity(size);
        if size > 0 {
            self.read_memory(&mut blob.as_mut_slice()[..size], address)?;
        }
        Ok(blob)
    }
}

pub type MapRef = Rc<RefCell<dyn MemoryMap>>;

// Decode up to 8 bytes as an unsigned scalar in the given byte order.
pub fn scalar_from_bytes(bytes: &[u8], endian: RunTimeEndian) -> u64 {
    let n = bytes.len().min(8);
    let mut buf = [0u8; 8];
    if endian.is_big_endian() {
        buf[8-n..].copy_from_slice(&bytes[..n]);
    } else {
        buf[..n].copy_from_slice(&bytes[..n]);
    }
    endian.read_u64(&buf)
}

pub fn pointer_from_bytes(bytes: &[u8], endian: RunTimeEndian) -> usize {
    scalar_from_bytes(bytes, endian) as usize
}

// Encode the low `out.len()` bytes of a scalar in the given byte order.
pub fn scalar_to_bytes(value: u64, out: &mut [u8], endian: RunTimeEndian) {
    let n = out.len().min(8);
    let mut buf = [0u8; 8];
    endian.write_u64(&mut buf, value);
    if endian.is_big_endian() {
        out[..n].copy_from_slice(&buf[8-n..]);
    } else {
        out[..n].copy_from_slice(&buf[..n]);
    }
}
