//! Scope frames and variable storage.
//!
//! All variables live in one central store; frames map names to [`VarId`]
//! slots. Pointers and references hold `VarId`s rather than Rust references,
//! so the scope stack stays free of borrow cycles and the whole structure
//! serializes for snapshots.

use ahash::AHashMap;

use crate::{
    ast::NodeId,
    error::{RunError, RunResult},
    value::{TypeDesc, Value},
};

/// Index of a variable slot in the central store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct VarId(u32);

impl VarId {
    fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("variable store exceeds u32"))
    }

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One variable slot.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Variable {
    pub value: Value,
    pub ty: TypeDesc,
    pub is_const: bool,
    /// Declared array dimensions, empty for scalars.
    pub dims: Vec<u32>,
    /// For reference variables: the slot reads and writes forward to.
    /// References cannot be rebound after initialization.
    pub alias: Option<VarId>,
    /// Declared name, kept for diagnostics and `VAR_SET` payloads.
    pub name: String,
}

impl Variable {
    #[must_use]
    pub fn scalar(value: Value, ty: TypeDesc, is_const: bool) -> Self {
        Self {
            value,
            ty,
            is_const,
            dims: Vec::new(),
            alias: None,
            name: String::new(),
        }
    }
}

/// One entry on the scope stack.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct ScopeFrame {
    names: AHashMap<String, VarId>,
    /// Function frames stop name lookup from leaking into the caller's
    /// locals; lookup falls through to globals instead.
    is_function_boundary: bool,
}

/// The scope stack plus the static-local side table.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Scopes {
    store: Vec<Variable>,
    frames: Vec<ScopeFrame>,
    /// Static locals keyed by (function identity, declaration site). They
    /// bind on first execution and survive frame pop.
    statics: AHashMap<(NodeId, NodeId), VarId>,
}

impl Scopes {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Vec::new(),
            frames: vec![ScopeFrame {
                names: AHashMap::new(),
                is_function_boundary: false,
            }],
            statics: AHashMap::new(),
        }
    }

    pub fn push(&mut self, is_function_boundary: bool) {
        self.frames.push(ScopeFrame {
            names: AHashMap::new(),
            is_function_boundary,
        });
    }

    pub fn pop(&mut self) {
        debug_assert!(self.frames.len() > 1, "global frame is never popped");
        self.frames.pop();
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Pops frames down to `depth`, for break/continue/return unwinding.
    pub fn truncate(&mut self, depth: usize) {
        debug_assert!(depth >= 1);
        self.frames.truncate(depth);
    }

    /// Declares a variable in the top frame, shadowing outer bindings.
    pub fn declare(&mut self, name: &str, mut variable: Variable) -> VarId {
        if variable.name.is_empty() {
            variable.name = name.to_owned();
        }
        let id = VarId::new(self.store.len());
        self.store.push(variable);
        self.frames
            .last_mut()
            .expect("scope stack never empty")
            .names
            .insert(name.to_owned(), id);
        id
    }

    /// Binds an existing slot under a new name (used for static locals on
    /// re-entry).
    pub fn bind(&mut self, name: &str, id: VarId) {
        self.frames
            .last_mut()
            .expect("scope stack never empty")
            .names
            .insert(name.to_owned(), id);
    }

    /// Name lookup: walk frames from the top; a function boundary cuts off
    /// the walk and falls through to file scope.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<VarId> {
        for frame in self.frames.iter().rev() {
            if let Some(id) = frame.names.get(name) {
                return Some(*id);
            }
            if frame.is_function_boundary {
                break;
            }
        }
        self.frames[0].names.get(name).copied()
    }

    /// Follows a reference variable to its final storage slot.
    #[must_use]
    pub fn resolve(&self, id: VarId) -> VarId {
        let mut current = id;
        // Alias chains are at most a few links; references cannot rebind.
        for _ in 0..32 {
            match self.store[current.index()].alias {
                Some(next) => current = next,
                None => return current,
            }
        }
        current
    }

    #[must_use]
    pub fn get(&self, id: VarId) -> &Variable {
        &self.store[self.resolve(id).index()]
    }

    pub fn get_mut(&mut self, id: VarId) -> &mut Variable {
        let resolved = self.resolve(id);
        &mut self.store[resolved.index()]
    }

    /// Reads through references.
    #[must_use]
    pub fn read(&self, id: VarId) -> Value {
        self.get(id).value.clone()
    }

    /// Writes through references, enforcing const.
    pub fn write(&mut self, id: VarId, name: &str, value: Value) -> RunResult<()> {
        let variable = self.get_mut(id);
        if variable.is_const {
            return Err(RunError::type_error(format!(
                "cannot assign to const variable `{name}`"
            )));
        }
        variable.value = value;
        Ok(())
    }

    #[must_use]
    pub fn static_slot(&self, function: NodeId, decl: NodeId) -> Option<VarId> {
        self.statics.get(&(function, decl)).copied()
    }

    pub fn bind_static(&mut self, function: NodeId, decl: NodeId, id: VarId) {
        self.statics.insert((function, decl), id);
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.store.len()
    }
}

impl Default for Scopes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypeDesc;

    fn int_var(v: i64) -> Variable {
        Variable::scalar(Value::int(v), TypeDesc::parse("int", 4), false)
    }

    #[test]
    fn shadowing_and_popping() {
        let mut scopes = Scopes::new();
        scopes.declare("x", int_var(1));
        scopes.push(false);
        scopes.declare("x", int_var(2));
        let inner = scopes.lookup("x").unwrap();
        assert_eq!(scopes.read(inner).as_i64().unwrap(), 2);
        scopes.pop();
        let outer = scopes.lookup("x").unwrap();
        assert_eq!(scopes.read(outer).as_i64().unwrap(), 1);
    }

    #[test]
    fn function_boundary_hides_caller_locals() {
        let mut scopes = Scopes::new();
        scopes.declare("global_var", int_var(1));
        scopes.push(false);
        scopes.declare("caller_local", int_var(2));
        scopes.push(true); // callee frame
        assert!(scopes.lookup("caller_local").is_none());
        assert!(scopes.lookup("global_var").is_some());
        scopes.pop();
        scopes.pop();
    }

    #[test]
    fn const_write_rejected() {
        let mut scopes = Scopes::new();
        let id = scopes.declare(
            "k",
            Variable::scalar(Value::int(5), TypeDesc::parse("int", 4), true),
        );
        let err = scopes.write(id, "k", Value::int(6)).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::TypeError);
    }

    #[test]
    fn references_forward_reads_and_writes() {
        let mut scopes = Scopes::new();
        let target = scopes.declare("x", int_var(10));
        let mut reference = int_var(0);
        reference.alias = Some(target);
        let r = scopes.declare("r", reference);
        assert_eq!(scopes.read(r).as_i64().unwrap(), 10);
        scopes.write(r, "r", Value::int(20)).unwrap();
        assert_eq!(scopes.read(target).as_i64().unwrap(), 20);
    }
}
