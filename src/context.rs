use crate::{*, error::*, memory::*, registers::*, persistent::*};
use std::{rc::{Rc, Weak}, cell::RefCell};

// The debugged program, as far as expression staging is concerned: it owns the user's
// `$`-variables. Symbols, breakpoints etc. live elsewhere in the debugger.
#[derive(Debug)]
pub struct Target {
    pub persistent_variables: PersistentVariableStore,
}

pub type TargetRef = Rc<RefCell<Target>>;

impl Target {
    pub fn new() -> TargetRef {
        Rc::new(RefCell::new(Target {persistent_variables: PersistentVariableStore::new()}))
    }
}

// A non-owning path to the target. The target can die between materialize and dematerialize
// (process exited, target deleted); holders find out when they try to use it.
#[derive(Clone)]
pub struct ExecutionScope {
    target: Weak<RefCell<Target>>,
}

impl ExecutionScope {
    pub fn new(target: &TargetRef) -> ExecutionScope {
        ExecutionScope {target: Rc::downgrade(target)}
    }

    pub fn target(&self) -> Result<TargetRef> {
        match self.target.upgrade() {
            Some(t) => Ok(t),
            None => err!(NoTarget, "target is gone"),
        }
    }
}

// The stack frame an expression runs at: a register bank plus a way back to the target.
// Frames are shared handles because a dematerializer holds one across the expression run.
pub struct StackFrame {
    pub regs: Registers,
    pub scope: ExecutionScope,
}

pub type FrameRef = Rc<RefCell<StackFrame>>;

impl StackFrame {
    pub fn new(target: &TargetRef) -> FrameRef {
        Rc::new(RefCell::new(StackFrame {regs: Registers::default(), scope: ExecutionScope::new(target)}))
    }
}

// An externally-visible symbol. Resolution happened upstream; the record carries the static
// address and, if the module is loaded, the relocated one.
#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    pub file_address: usize,
    pub load_address: usize,
}

impl Symbol {
    pub fn new(name: &str, file_address: usize) -> Symbol {
        Symbol {name: name.to_string(), file_address, load_address: INVALID_ADDRESS}
    }

    pub fn with_load_address(name: &str, file_address: usize, load_address: usize) -> Symbol {
        Symbol {name: name.to_string(), file_address, load_address}
    }

    pub fn resolved_address(&self) -> usize {
        if self.load_address != INVALID_ADDRESS {
            self.load_address
        } else {
            self.file_address
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::context::*;

    #[test]
    fn scope_outlives_target() {
        let target = Target::new();
        let scope = ExecutionScope::new(&target);
        assert!(scope.target().is_ok());
        drop(target);
        assert!(scope.target().unwrap_err().is_no_target());
    }

    #[test]
    fn symbol_address_preference() {
        let s = Symbol::new("malloc", 0x4120);
        assert_eq!(s.resolved_address(), 0x4120);
        let s = Symbol::with_load_address("malloc", 0x4120, 0x7f0000004120);
        assert_eq!(s.resolved_address(), 0x7f0000004120);
    }
}
