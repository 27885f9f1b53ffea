use std::fmt;

use serde::{Deserialize, Serialize};

use super::value::Value;

/// Identifies one document (frame) instance.
///
/// Frames occupy slots; every time a slot's document is replaced (navigation, reload,
/// crash) the generation is bumped, so a handle to the old document never compares equal
/// to the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeId {
    index: u32,
    generation: u32,
}

impl ScopeId {
    /// Scope for functions that are callable from every document.
    pub const GLOBAL: ScopeId = ScopeId {
        index: u32::MAX,
        generation: 0,
    };

    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_global(&self) -> bool {
        *self == Self::GLOBAL
    }

    pub fn to_value(self) -> Value {
        Value::List(vec![
            Value::Int(i64::from(self.index)),
            Value::Int(i64::from(self.generation)),
        ])
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let [index, generation] = value.as_list()? else {
            return None;
        };
        let index = u32::try_from(index.as_int()?).ok()?;
        let generation = u32::try_from(generation.as_int()?).ok()?;
        Some(Self { index, generation })
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_global() {
            f.write_str("global")
        } else {
            write!(f, "{}v{}", self.index, self.generation)
        }
    }
}

/// Weak, non-owning reference to the script context that originated a call.
///
/// Holding one does not keep the context alive; it is only compared against the scope
/// named in a teardown notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextRef(ScopeId);

impl ContextRef {
    pub fn new(scope: ScopeId) -> Self {
        Self(scope)
    }

    pub fn scope(&self) -> ScopeId {
        self.0
    }

    pub fn belongs_to(&self, scope: ScopeId) -> bool {
        self.0 == scope
    }
}

/// Hands out frame slots and their generations.
#[derive(Debug, Default)]
pub struct ScopeAllocator {
    generations: Vec<u32>,
    live: Vec<bool>,
    free: Vec<u32>,
}

impl ScopeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a scope for a brand new frame.
    pub fn allocate(&mut self) -> ScopeId {
        if let Some(index) = self.free.pop() {
            let slot = index as usize;
            self.generations[slot] = self.generations[slot].wrapping_add(1);
            self.live[slot] = true;
            return ScopeId::new(index, self.generations[slot]);
        }

        let index = self.generations.len() as u32;
        self.generations.push(0);
        self.live.push(true);
        ScopeId::new(index, 0)
    }

    /// Replace the document living in `scope`'s slot with a fresh one.
    ///
    /// Returns `None` if `scope` is stale.
    pub fn renew(&mut self, scope: ScopeId) -> Option<ScopeId> {
        if !self.is_live(scope) {
            return None;
        }
        let slot = scope.index as usize;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        Some(ScopeId::new(scope.index, self.generations[slot]))
    }

    pub fn release(&mut self, scope: ScopeId) -> bool {
        if !self.is_live(scope) {
            return false;
        }
        self.live[scope.index as usize] = false;
        self.free.push(scope.index);
        true
    }

    pub fn is_live(&self, scope: ScopeId) -> bool {
        let slot = scope.index as usize;
        !scope.is_global()
            && self.live.get(slot).copied().unwrap_or(false)
            && self.generations.get(slot) == Some(&scope.generation)
    }
}
