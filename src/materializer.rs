use crate::{*, error::*, log::*, util::*, memory::*, types::*, value::*, registers::*, persistent::*, context::*};
use std::{rc::{Rc, Weak}, cell::RefCell};

// Staging of expression arguments across the debugger/inferior boundary.
//
// Compiled expression code expects its free variables (frame locals, $-variables, symbols,
// registers, the result slot) laid out as one contiguous struct at a known inferior address.
// The Materializer packs those entities into the struct and copies values in before the
// expression runs; the Dematerializer it hands out copies mutations back out afterwards and
// releases whatever scratch memory the round trip needed. Entities are visited strictly in
// insertion order during both halves, and a materializer has at most one live dematerializer
// at a time.

// Assigns offsets within the argument struct. current_offset is rounded up to each member's
// alignment before assignment. struct_alignment is only (re)assigned while current_offset
// is 0, so in practice the first member dictates it and later, wider members don't. That
// matches what the expression compiler has always been handed; widening it here would change
// the ABI between debugger and compiled code, so don't without a decision upstream.
pub struct StructLayout {
    current_offset: usize,
    struct_alignment: usize,
}

impl StructLayout {
    pub fn new() -> StructLayout {
        StructLayout {current_offset: 0, struct_alignment: 8}
    }

    pub fn append(&mut self, size: usize, alignment: usize) -> usize {
        if self.current_offset == 0 {
            self.struct_alignment = alignment;
        }
        if alignment > 0 && self.current_offset % alignment != 0 {
            self.current_offset += alignment - self.current_offset % alignment;
        }
        let offset = self.current_offset;
        self.current_offset += size;
        offset
    }

    pub fn byte_size(&self) -> usize { self.current_offset }
    pub fn alignment(&self) -> usize { self.struct_alignment }
}

// One typed slot in the argument struct. (size, alignment) are fixed at construction,
// offset once the layout engine assigns it.
struct Entity {
    size: usize,
    alignment: usize,
    offset: usize,
    kind: EntityKind,
}

enum EntityKind {
    PersistentVariable(PersistentVariableEntity),
    Variable(VariableEntity),
    ResultVariable(ResultVariableEntity),
    Symbol(SymbolEntity),
    Register(RegisterEntity),
}

impl Entity {
    fn materialize(&mut self, frame: Option<&FrameRef>, map: &mut dyn MemoryMap, process_address: usize) -> Result<()> {
        let slot = process_address + self.offset;
        match &mut self.kind {
            EntityKind::PersistentVariable(e) => e.materialize(map, slot),
            EntityKind::Variable(e) => e.materialize(frame, map, slot),
            EntityKind::ResultVariable(e) => e.materialize(map, slot),
            EntityKind::Symbol(e) => e.materialize(map, slot),
            EntityKind::Register(e) => e.materialize(frame, map, slot),
        }
    }

    fn dematerialize(&mut self, frame: Option<&FrameRef>, map: &mut dyn MemoryMap, process_address: usize, frame_top: usize, frame_bottom: usize) -> Result<()> {
        let slot = process_address + self.offset;
        match &mut self.kind {
            EntityKind::PersistentVariable(e) => e.dematerialize(map, slot, frame_top, frame_bottom),
            EntityKind::Variable(e) => e.dematerialize(frame, map),
            EntityKind::ResultVariable(_) => err!(WrongEntry, "tried to dematerialize a result variable through the normal dematerialize path"),
            EntityKind::Symbol(_) => Ok(()),
            EntityKind::Register(e) => e.dematerialize(frame, map, slot),
        }
    }

    // Only the entity the materializer recorded as the result takes this path.
    fn dematerialize_result(&mut self, map: &mut dyn MemoryMap, process_address: usize) -> Result<PersistentVariableRef> {
        let slot = process_address + self.offset;
        match &mut self.kind {
            EntityKind::ResultVariable(e) => e.dematerialize(map, slot),
            _ => err!(Internal, "result dematerialization requested for a non-result entity"),
        }
    }

    fn wipe(&mut self, map: &mut dyn MemoryMap) {
        match &mut self.kind {
            EntityKind::Variable(e) => e.wipe(map),
            EntityKind::ResultVariable(e) => e.wipe(map),
            EntityKind::PersistentVariable(_) | EntityKind::Symbol(_) | EntityKind::Register(_) => (),
        }
    }

    fn dump_to_log(&self, map: &mut dyn MemoryMap, process_address: usize, log: &mut Log) {
        let slot = process_address + self.offset;
        match &self.kind {
            EntityKind::PersistentVariable(e) => {
                let v = e.var.borrow();
                log!(log, "0x{:x}: persistent variable {}", slot, v.name);
                log!(log, "pointer:");
                dump_region(map, slot, self.size, log);
                log!(log, "target:");
                match map.read_pointer(slot) {
                    Ok(p) => dump_region(map, p, v.byte_size(), log),
                    Err(_) => log!(log, "  <could not be read>"),
                }
            }
            EntityKind::Variable(e) => {
                log!(log, "0x{:x}: variable {}", slot, e.var.borrow().name);
                log!(log, "pointer:");
                dump_region(map, slot, self.size, log);
                if e.temporary_allocation != INVALID_ADDRESS {
                    log!(log, "temporary allocation:");
                    dump_region(map, e.temporary_allocation, e.temporary_allocation_size, log);
                } else {
                    log!(log, "points to process memory");
                }
            }
            EntityKind::ResultVariable(e) => {
                log!(log, "0x{:x}: result", slot);
                log!(log, "pointer:");
                dump_region(map, slot, self.size, log);
                if e.temporary_allocation != INVALID_ADDRESS {
                    log!(log, "temporary allocation:");
                    dump_region(map, e.temporary_allocation, e.temporary_allocation_size, log);
                } else {
                    log!(log, "points to process memory");
                }
            }
            EntityKind::Symbol(e) => {
                log!(log, "0x{:x}: symbol {}", slot, e.symbol.name);
                log!(log, "pointer:");
                dump_region(map, slot, self.size, log);
            }
            EntityKind::Register(e) => {
                log!(log, "0x{:x}: register {}", slot, e.register_info.reg);
                log!(log, "value:");
                dump_region(map, slot, self.size, log);
            }
        }
    }
}

fn dump_region(map: &mut dyn MemoryMap, address: usize, size: usize, log: &mut Log) {
    if size == 0 {
        log!(log, "  <empty>");
        return;
    }
    let mut buf = vec![0u8; size];
    match map.read_memory(&mut buf, address) {
        Err(_) => log!(log, "  <could not be read>"),
        Ok(()) => {
            for (i, chunk) in buf.chunks(16).enumerate() {
                log!(log, "  0x{:x}: {}", address + i * 16, hexdump(chunk, 64));
            }
        }
    }
}

// ------------------------- persistent $-variable -------------------------

struct PersistentVariableEntity {
    var: PersistentVariableRef,
}

impl PersistentVariableEntity {
    // Allocate inferior storage for the variable and seed it with the host-side bytes.
    fn make_allocation(&self, map: &mut dyn MemoryMap) -> Result<()> {
        let mut v = self.var.borrow_mut();
        let mem = match map.malloc(v.byte_size(), 8, Permissions::rw(), AllocationPolicy::Mirror) {
            Ok(a) => a,
            Err(e) => return err!(AllocationFailed, "couldn't allocate a memory area to store {}: {}", v.name, e),
        };
        v.live = LiveAddress::Load(mem);
        // If the allocation is permanent there's nothing left to allocate on later runs.
        if v.flags.contains(PersistentVariableFlags::KEEP_IN_TARGET) {
            v.flags.remove(PersistentVariableFlags::NEEDS_ALLOCATION);
        }
        v.value_updated();
        let n = v.byte_size();
        if n > 0 {
            if let Err(e) = map.write_memory(mem, &v.value.as_slice()[..n]) {
                return err!(WriteFailed, "couldn't write {} to the target: {}", v.name, e);
            }
        }
        Ok(())
    }

    fn destroy_allocation(&self, map: &mut dyn MemoryMap) -> Result<()> {
        let v = self.var.borrow();
        let addr = match v.live.address() {
            Some(a) => a,
            None => return err!(Internal, "no live allocation to deallocate for {}", v.name),
        };
        if let Err(e) = map.free(addr) {
            return err!(DeallocationFailed, "couldn't deallocate memory for {}: {}", v.name, e);
        }
        Ok(())
    }

    fn materialize(&mut self, map: &mut dyn MemoryMap, slot: usize) -> Result<()> {
        if self.var.borrow().flags.contains(PersistentVariableFlags::NEEDS_ALLOCATION) {
            self.make_allocation(map)?;
        }
        let v = self.var.borrow();
        match v.live.address() {
            Some(addr) if v.flags.intersects(PersistentVariableFlags::IS_PROGRAM_REFERENCE | PersistentVariableFlags::DEBUGGER_ALLOCATED) => {
                if let Err(e) = map.write_pointer(slot, addr) {
                    return err!(WriteFailed, "couldn't write the location of {} to memory: {}", v.name, e);
                }
                Ok(())
            }
            _ => err!(NotMaterialized, "no materialization happened for persistent variable {}", v.name),
        }
    }

    fn dematerialize(&mut self, map: &mut dyn MemoryMap, slot: usize, frame_top: usize, frame_bottom: usize) -> Result<()> {
        let mut v = self.var.borrow_mut();
        if !v.flags.intersects(PersistentVariableFlags::DEBUGGER_ALLOCATED | PersistentVariableFlags::IS_PROGRAM_REFERENCE) {
            return err!(NotDematerialized, "no dematerialization happened for persistent variable {}", v.name);
        }
        if v.flags.contains(PersistentVariableFlags::IS_PROGRAM_REFERENCE) && v.live.address().is_none() {
            // The expression itself provided the location; pick it up from the slot.
            let location = match map.read_pointer(slot) {
                Ok(a) => a,
                Err(e) => return err!(ReadFailed, "couldn't read the address of program-allocated variable {}: {}", v.name, e),
            };
            v.live = LiveAddress::Load(location);
            if frame_top != INVALID_ADDRESS && frame_bottom != INVALID_ADDRESS && location >= frame_bottom && location <= frame_top {
                // Resident in the expression's own stack frame, which is about to be torn
                // down. Force reallocation and a snapshot on the next run.
                v.flags.insert(PersistentVariableFlags::DEBUGGER_ALLOCATED | PersistentVariableFlags::NEEDS_ALLOCATION | PersistentVariableFlags::NEEDS_FREEZE_DRY);
                v.flags.remove(PersistentVariableFlags::IS_PROGRAM_REFERENCE);
            }
        }
        let mem = match v.live {
            LiveAddress::None => return err!(NotMaterialized, "couldn't find the memory area used to store {}", v.name),
            LiveAddress::File(_) => return err!(BadAddressForm, "the address of the memory area for {} is in an incorrect format", v.name),
            LiveAddress::Load(a) => a,
        };
        if v.flags.intersects(PersistentVariableFlags::NEEDS_FREEZE_DRY | PersistentVariableFlags::KEEP_IN_TARGET) {
            v.value_updated();
            let n = v.byte_size();
            if n > 0 {
                let r = map.read_memory(&mut v.value.as_mut_slice()[..n], mem);
                if let Err(e) = r {
                    return err!(ReadFailed, "couldn't read the contents of {} from memory: {}", v.name, e);
                }
            }
            v.flags.remove(PersistentVariableFlags::NEEDS_FREEZE_DRY);
        }
        let release = v.flags.contains(PersistentVariableFlags::NEEDS_ALLOCATION) && !v.flags.contains(PersistentVariableFlags::KEEP_IN_TARGET);
        drop(v);
        if release {
            self.destroy_allocation(map)?;
        }
        Ok(())
    }
}

// ------------------------- frame-local variable -------------------------

struct VariableEntity {
    var: VariableRef,
    is_reference: bool,
    // Scratch inferior memory, present iff the variable wasn't addressable and had to be
    // spilled. Exclusively owned by this entity.
    temporary_allocation: usize,
    temporary_allocation_size: usize,
}

impl VariableEntity {
    fn new(var: &VariableRef) -> VariableEntity {
        let is_reference = var.borrow().type_.is_reference();
        VariableEntity {var: var.clone(), is_reference, temporary_allocation: INVALID_ADDRESS, temporary_allocation_size: 0}
    }

    fn materialize(&mut self, frame: Option<&FrameRef>, map: &mut dyn MemoryMap, slot: usize) -> Result<()> {
        let valobj = ValueObject::from_variable(&self.var, frame, map)?;
        let name = self.var.borrow().name.clone();
        if self.is_reference {
            // The value bytes of a reference are the referent's address.
            let referent = valobj.data.get_usize_prefix(map.address_byte_size(), map.byte_order());
            if let Err(e) = map.write_pointer(slot, referent) {
                return err!(WriteFailed, "couldn't write the contents of reference variable {} to memory: {}", name, e);
            }
            return Ok(());
        }
        match valobj.address_of() {
            Ok(addr) => {
                if let Err(e) = map.write_pointer(slot, addr) {
                    return err!(WriteFailed, "couldn't write the address of variable {} to memory: {}", name, e);
                }
            }
            Err(_) => {
                // No stable address (register-resident, constant-folded). Spill to scratch
                // and pass that by reference instead.
                if self.temporary_allocation != INVALID_ADDRESS {
                    return err!(DoubleAllocation, "trying to create a temporary region for {} but one exists", name);
                }
                let (byte_size, byte_align) = {
                    let v = self.var.borrow();
                    (v.type_.byte_size, v.type_.byte_alignment())
                };
                if valobj.data_byte_size != byte_size {
                    return err!(SizeMismatch, "size of variable {} disagrees with the value object's size", name);
                }
                let mem = match map.malloc(byte_size, byte_align, Permissions::rw(), AllocationPolicy::Mirror) {
                    Ok(a) => a,
                    Err(e) => return err!(AllocationFailed, "couldn't allocate a temporary region for {}: {}", name, e),
                };
                self.temporary_allocation = mem;
                self.temporary_allocation_size = byte_size;
                if byte_size > 0 {
                    if let Err(e) = map.write_memory(mem, &valobj.data.as_slice()[..byte_size]) {
                        return err!(WriteFailed, "couldn't write to the temporary region for {}: {}", name, e);
                    }
                }
                if let Err(e) = map.write_pointer(slot, mem) {
                    return err!(WriteFailed, "couldn't write the address of the temporary region for {}: {}", name, e);
                }
            }
        }
        Ok(())
    }

    fn dematerialize(&mut self, frame: Option<&FrameRef>, map: &mut dyn MemoryMap) -> Result<()> {
        if self.temporary_allocation == INVALID_ADDRESS {
            // Mutations went directly to the variable's real location.
            return Ok(());
        }
        let mut valobj = ValueObject::from_variable(&self.var, frame, map)?;
        let name = self.var.borrow().name.clone();
        let data = match map.read_data(self.temporary_allocation, valobj.byte_size) {
            Ok(d) => d,
            Err(e) => return err!(ReadFailed, "couldn't get the data for variable {}: {}", name, e),
        };
        valobj.set_data(frame, map, &data)?;
        if let Err(e) = map.free(self.temporary_allocation) {
            return err!(DeallocationFailed, "couldn't free the temporary region for {}: {}", name, e);
        }
        self.temporary_allocation = INVALID_ADDRESS;
        self.temporary_allocation_size = 0;
        Ok(())
    }

    fn wipe(&mut self, map: &mut dyn MemoryMap) {
        if self.temporary_allocation != INVALID_ADDRESS {
            let _ = map.free(self.temporary_allocation);
            self.temporary_allocation = INVALID_ADDRESS;
            self.temporary_allocation_size = 0;
        }
    }
}

// ------------------------- expression result -------------------------

struct ResultVariableEntity {
    type_: TypeDesc,
    is_program_reference: bool,
    keep_in_memory: bool,
    temporary_allocation: usize,
    temporary_allocation_size: usize,
}

impl ResultVariableEntity {
    fn materialize(&mut self, map: &mut dyn MemoryMap, slot: usize) -> Result<()> {
        if self.is_program_reference {
            // The expression fills the slot with a program address itself.
            return Ok(());
        }
        if self.temporary_allocation != INVALID_ADDRESS {
            return err!(DoubleAllocation, "trying to create a temporary region for the result but one exists");
        }
        let mem = match map.malloc(self.type_.byte_size, self.type_.byte_alignment(), Permissions::rw(), AllocationPolicy::Mirror) {
            Ok(a) => a,
            Err(e) => return err!(AllocationFailed, "couldn't allocate a temporary region for the result: {}", e),
        };
        self.temporary_allocation = mem;
        self.temporary_allocation_size = self.type_.byte_size;
        if let Err(e) = map.write_pointer(slot, mem) {
            return err!(WriteFailed, "couldn't write the address of the temporary region for the result: {}", e);
        }
        Ok(())
    }

    // Promote the slot's pointee to a fresh persistent variable.
    fn dematerialize(&mut self, map: &mut dyn MemoryMap, slot: usize) -> Result<PersistentVariableRef> {
        let scope = match map.best_execution_scope() {
            Some(s) => s,
            None => return err!(NoExecutionScope, "couldn't dematerialize a result variable: invalid execution context scope"),
        };
        let address = match map.read_pointer(slot) {
            Ok(a) => a,
            Err(e) => return err!(ReadFailed, "couldn't dematerialize a result variable: couldn't read its address: {}", e),
        };
        let target = match scope.target() {
            Ok(t) => t,
            Err(_) => return err!(NoTarget, "couldn't dematerialize a result variable: no target"),
        };
        let ret = {
            let mut t = target.borrow_mut();
            let name = t.persistent_variables.next_persistent_variable_name();
            t.persistent_variables.create_variable(name, self.type_.clone(), map.byte_order(), map.address_byte_size())
        };
        {
            let mut r = ret.borrow_mut();
            r.live = LiveAddress::Load(address);
            r.value_updated();
            let n = r.byte_size();
            if n > 0 {
                if let Err(e) = map.read_memory(&mut r.value.as_mut_slice()[..n], address) {
                    return err!(ReadFailed, "couldn't dematerialize a result variable: couldn't read its memory: {}", e);
                }
            }
            if !self.keep_in_memory && self.temporary_allocation != INVALID_ADDRESS {
                // The value was snapshotted above; the scratch region can go. Storage will
                // be reallocated if the variable is ever staged again.
                r.flags.insert(PersistentVariableFlags::NEEDS_ALLOCATION);
                let _ = map.free(self.temporary_allocation);
            } else {
                r.flags.insert(PersistentVariableFlags::DEBUGGER_ALLOCATED);
            }
        }
        self.temporary_allocation = INVALID_ADDRESS;
        self.temporary_allocation_size = 0;
        Ok(ret)
    }

    fn wipe(&mut self, map: &mut dyn MemoryMap) {
        if !self.keep_in_memory && self.temporary_allocation != INVALID_ADDRESS {
            let _ = map.free(self.temporary_allocation);
        }
        self.temporary_allocation = INVALID_ADDRESS;
        self.temporary_allocation_size = 0;
    }
}

// ------------------------- symbol -------------------------

struct SymbolEntity {
    symbol: Symbol,
}

impl SymbolEntity {
    fn materialize(&mut self, map: &mut dyn MemoryMap, slot: usize) -> Result<()> {
        let target = map.best_execution_scope().and_then(|s| s.target().ok());
        if target.is_none() {
            return err!(NoTarget, "couldn't resolve symbol {} because there is no target", self.symbol.name);
        }
        let resolved = self.symbol.resolved_address();
        if let Err(e) = map.write_pointer(slot, resolved) {
            return err!(WriteFailed, "couldn't write the address of symbol {}: {}", self.symbol.name, e);
        }
        Ok(())
    }
}

// ------------------------- register -------------------------

struct RegisterEntity {
    register_info: RegisterInfo,
}

impl RegisterEntity {
    fn materialize(&mut self, frame: Option<&FrameRef>, map: &mut dyn MemoryMap, slot: usize) -> Result<()> {
        let frame = match frame {
            Some(f) => f,
            None => return err!(NoFrame, "couldn't materialize register {} without a stack frame", self.register_info.reg),
        };
        let reg_value = match frame.borrow().regs.read_register(&self.register_info, map.byte_order()) {
            Ok(v) => v,
            Err(e) => return err!(ReadFailed, "couldn't read the value of register {}: {}", self.register_info.reg, e),
        };
        if reg_value.byte_size() != self.register_info.byte_size {
            return err!(SizeMismatch, "data for register {} had size {} but we expected {}", self.register_info.reg, reg_value.byte_size(), self.register_info.byte_size);
        }
        if let Err(e) = map.write_memory(slot, reg_value.as_slice()) {
            return err!(WriteFailed, "couldn't write the contents of register {}: {}", self.register_info.reg, e);
        }
        Ok(())
    }

    fn dematerialize(&mut self, frame: Option<&FrameRef>, map: &mut dyn MemoryMap, slot: usize) -> Result<()> {
        let frame = match frame {
            Some(f) => f,
            None => return err!(NoFrame, "couldn't dematerialize register {} without a stack frame", self.register_info.reg),
        };
        let n = self.register_info.byte_size;
        let data = match map.read_data(slot, n) {
            Ok(d) => d,
            Err(e) => return err!(ReadFailed, "couldn't get the data for register {}: {}", self.register_info.reg, e),
        };
        if let Err(e) = frame.borrow_mut().regs.write_register(&self.register_info, &data.as_slice()[..n], map.byte_order()) {
            return err!(WriteFailed, "couldn't write the value of register {}: {}", self.register_info.reg, e);
        }
        Ok(())
    }
}

// ------------------------- driver -------------------------

pub struct Materializer {
    entities: Rc<RefCell<Vec<Entity>>>,
    layout: StructLayout,
    result_index: Option<usize>,
    // Non-owning; lets us force-wipe an outstanding dematerializer when the materializer dies,
    // and refuse a second materialize while one is live.
    dematerializer: Weak<RefCell<DematerializerShared>>,
}

struct DematerializerShared {
    entities: Rc<RefCell<Vec<Entity>>>,
    result_index: Option<usize>,
    frame: Weak<RefCell<StackFrame>>,
    // Taken on consumption; None means the handle is spent.
    map: Option<MapRef>,
    process_address: usize,
}

// Single-use handle bound to one materialization. Consumed by dematerialize (successful or
// not) or by wipe; afterwards is_valid() is false and dematerialize fails.
pub struct Dematerializer {
    shared: Rc<RefCell<DematerializerShared>>,
}

impl std::fmt::Debug for Dematerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dematerializer").finish_non_exhaustive()
    }
}

impl Materializer {
    pub fn new() -> Materializer {
        Materializer {entities: Rc::new(RefCell::new(Vec::new())), layout: StructLayout::new(), result_index: None, dematerializer: Weak::new()}
    }

    fn add_struct_member(&mut self, mut entity: Entity) -> usize {
        let offset = self.layout.append(entity.size, entity.alignment);
        entity.offset = offset;
        self.entities.borrow_mut().push(entity);
        offset
    }

    // All by-reference entities get a pointer-sized slot.
    pub fn add_persistent_variable(&mut self, var: &PersistentVariableRef) -> usize {
        self.add_struct_member(Entity {size: 8, alignment: 8, offset: 0, kind: EntityKind::PersistentVariable(PersistentVariableEntity {var: var.clone()})})
    }

    pub fn add_variable(&mut self, var: &VariableRef) -> usize {
        self.add_struct_member(Entity {size: 8, alignment: 8, offset: 0, kind: EntityKind::Variable(VariableEntity::new(var))})
    }

    pub fn add_result_variable(&mut self, type_: &TypeDesc, is_program_reference: bool, keep_in_memory: bool) -> usize {
        let offset = self.add_struct_member(Entity {size: 8, alignment: 8, offset: 0, kind: EntityKind::ResultVariable(ResultVariableEntity {
            type_: type_.clone(), is_program_reference, keep_in_memory, temporary_allocation: INVALID_ADDRESS, temporary_allocation_size: 0,
        })});
        self.result_index = Some(self.entities.borrow().len() - 1);
        offset
    }

    pub fn add_symbol(&mut self, symbol: Symbol) -> usize {
        self.add_struct_member(Entity {size: 8, alignment: 8, offset: 0, kind: EntityKind::Symbol(SymbolEntity {symbol})})
    }

    pub fn add_register(&mut self, register_info: RegisterInfo) -> usize {
        // Alignment equals size, conservatively.
        self.add_struct_member(Entity {size: register_info.byte_size, alignment: register_info.byte_size, offset: 0, kind: EntityKind::Register(RegisterEntity {register_info})})
    }

    pub fn struct_byte_size(&self) -> usize { self.layout.byte_size() }
    pub fn struct_alignment(&self) -> usize { self.layout.alignment() }

    pub fn dump_to_log(&self, map: &MapRef, process_address: usize, log: &mut Log) {
        let mut m = map.borrow_mut();
        for entity in self.entities.borrow().iter() {
            entity.dump_to_log(&mut *m, process_address, log);
        }
    }

    // Copies every entity into the argument struct at process_address, in insertion order,
    // stopping at the first failure. On failure nothing is rolled back: the struct is
    // tainted and earlier side effects (allocations, flag changes) stand.
    pub fn materialize(&mut self, frame: Option<&FrameRef>, map: &MapRef, process_address: usize, log: &mut Log) -> Result<Dematerializer> {
        // A consumed handle no longer counts: consumption severs the binding.
        if let Some(shared) = self.dematerializer.upgrade() {
            if shared.borrow().map.is_some() {
                return err!(AlreadyMaterialized, "couldn't materialize: already materialized");
            }
        }
        let scope = match frame {
            Some(f) => Some(f.borrow().scope.clone()),
            None => map.borrow().best_execution_scope(),
        };
        if scope.is_none() {
            return err!(NoExecutionScope, "couldn't materialize: target doesn't exist");
        }
        {
            let mut m = map.borrow_mut();
            for entity in self.entities.borrow_mut().iter_mut() {
                entity.materialize(frame, &mut *m, process_address)?;
            }
            log!(log, "materialized {} entities into the argument struct at 0x{:x}", self.entities.borrow().len(), process_address);
            if log.verbose {
                for entity in self.entities.borrow().iter() {
                    entity.dump_to_log(&mut *m, process_address, log);
                }
            }
        }
        let shared = Rc::new(RefCell::new(DematerializerShared {
            entities: self.entities.clone(),
            result_index: self.result_index,
            frame: match frame { Some(f) => Rc::downgrade(f), None => Weak::new() },
            map: Some(map.clone()),
            process_address,
        }));
        self.dematerializer = Rc::downgrade(&shared);
        Ok(Dematerializer {shared})
    }
}

impl Drop for Materializer {
    fn drop(&mut self) {
        if let Some(shared) = self.dematerializer.upgrade() {
            Dematerializer::wipe_shared(&shared);
        }
    }
}

impl Dematerializer {
    pub fn is_valid(&self) -> bool {
        self.shared.borrow().map.is_some()
    }

    // Reverse transfer: every entity in insertion order, the recorded result entity through
    // its specialized path. Stops at the first failure, but always wipes afterwards so no
    // scratch allocation survives, and always consumes the handle.
    pub fn dematerialize(&self, frame_top: usize, frame_bottom: usize, log: &mut Log) -> Result<Option<PersistentVariableRef>> {
        let (entities, result_index, frame, map, process_address) = {
            let s = self.shared.borrow();
            let map = match &s.map {
                Some(m) => m.clone(),
                None => return err!(Invalidated, "couldn't dematerialize: invalid dematerializer"),
            };
            (s.entities.clone(), s.result_index, s.frame.upgrade(), map, s.process_address)
        };
        if map.borrow().best_execution_scope().is_none() {
            self.wipe();
            return err!(NoExecutionScope, "couldn't dematerialize: target is gone");
        }
        let mut result = None;
        let mut outcome = Ok(());
        {
            let mut m = map.borrow_mut();
            log!(log, "dematerializing {} entities from the argument struct at 0x{:x}", entities.borrow().len(), process_address);
            if log.verbose {
                for entity in entities.borrow().iter() {
                    entity.dump_to_log(&mut *m, process_address, log);
                }
            }
            for (i, entity) in entities.borrow_mut().iter_mut().enumerate() {
                let r = if Some(i) == result_index {
                    match entity.dematerialize_result(&mut *m, process_address) {
                        Ok(var) => { result = Some(var); Ok(()) }
                        Err(e) => Err(e),
                    }
                } else {
                    entity.dematerialize(frame.as_ref(), &mut *m, process_address, frame_top, frame_bottom)
                };
                if let Err(e) = r {
                    outcome = Err(e);
                    break;
                }
            }
        }
        self.wipe();
        outcome?;
        Ok(result)
    }

    // Releases every entity's scratch allocation without copying anything back, and consumes
    // the handle. Idempotent.
    pub fn wipe(&self) {
        Self::wipe_shared(&self.shared);
    }

    fn wipe_shared(shared: &Rc<RefCell<DematerializerShared>>) {
        let mut s = shared.borrow_mut();
        let map = match s.map.take() {
            Some(m) => m,
            None => return,
        };
        s.process_address = INVALID_ADDRESS;
        let entities = s.entities.clone();
        drop(s);
        let mut m = map.borrow_mut();
        for entity in entities.borrow_mut().iter_mut() {
            entity.wipe(&mut *m);
        }
    }
}
