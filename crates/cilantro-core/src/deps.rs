//! Dependency recording.
//!
//! Each compiled method collects the symbols its body references; the sets
//! are merged into a module-wide ledger after the method finishes, so a
//! method that fails and gets stubbed contributes nothing.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

use crate::ty::{FieldId, MethodId, TypeId};

/// How strongly a type descriptor is needed.
///
/// `Necessary` descriptors back casts and field access; `Constructed` ones
/// additionally carry the vtable and GC layout because instances are
/// allocated. Constructed subsumes necessary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeStrength {
    Necessary,
    Constructed,
}

/// Per-method dependency accumulator. Value-deduplicated; recording the
/// same edge twice is a no-op, and a `Constructed` edge upgrades an
/// earlier `Necessary` one.
#[derive(Debug, Default, Clone)]
pub struct DependencySet {
    types: BTreeMap<TypeId, TypeStrength>,
    methods: BTreeSet<MethodId>,
    virtual_calls: BTreeSet<MethodId>,
    static_bases: BTreeSet<TypeId>,
    cctors: BTreeSet<TypeId>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_type(&mut self, ty: TypeId, strength: TypeStrength) {
        let entry = self.types.entry(ty).or_insert(strength);
        if strength > *entry {
            *entry = strength;
        }
    }

    pub fn record_method(&mut self, method: MethodId) {
        self.methods.insert(method);
    }

    /// Virtual-call edges keep the slot's implementations alive even when
    /// no direct call names them.
    pub fn record_virtual_call(&mut self, method: MethodId) {
        self.virtual_calls.insert(method);
    }

    pub fn record_static_base(&mut self, ty: TypeId) {
        self.static_bases.insert(ty);
    }

    pub fn record_cctor(&mut self, ty: TypeId) {
        self.cctors.insert(ty);
    }

    pub fn types(&self) -> impl Iterator<Item = (TypeId, TypeStrength)> + '_ {
        self.types.iter().map(|(t, s)| (*t, *s))
    }

    pub fn methods(&self) -> impl Iterator<Item = MethodId> + '_ {
        self.methods.iter().copied()
    }

    pub fn virtual_calls(&self) -> impl Iterator<Item = MethodId> + '_ {
        self.virtual_calls.iter().copied()
    }

    pub fn static_bases(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.static_bases.iter().copied()
    }

    pub fn cctors(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.cctors.iter().copied()
    }
}

/// Module-wide ledger. Insert-or-merge under a lock; iteration order is
/// the id order, so output derived from it is deterministic.
#[derive(Debug, Default)]
pub struct GlobalDependencies {
    inner: Mutex<DependencySet>,
}

impl GlobalDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&self, set: &DependencySet) {
        let mut inner = self.inner.lock();
        for (ty, strength) in set.types() {
            inner.record_type(ty, strength);
        }
        for m in set.methods() {
            inner.record_method(m);
        }
        for m in set.virtual_calls() {
            inner.record_virtual_call(m);
        }
        for t in set.static_bases() {
            inner.record_static_base(t);
        }
        for t in set.cctors() {
            inner.record_cctor(t);
        }
    }

    pub fn snapshot(&self) -> DependencySet {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;

    #[test]
    fn test_strength_upgrade() {
        let ty = TypeId::from_index(0);
        let mut set = DependencySet::new();
        set.record_type(ty, TypeStrength::Necessary);
        set.record_type(ty, TypeStrength::Constructed);
        set.record_type(ty, TypeStrength::Necessary);
        let collected: Vec<_> = set.types().collect();
        assert_eq!(collected, vec![(ty, TypeStrength::Constructed)]);
    }

    #[test]
    fn test_merge_dedups() {
        let global = GlobalDependencies::new();
        let m = MethodId::from_index(7);
        let mut a = DependencySet::new();
        a.record_method(m);
        let mut b = DependencySet::new();
        b.record_method(m);
        global.merge(&a);
        global.merge(&b);
        assert_eq!(global.snapshot().methods().count(), 1);
    }
}
