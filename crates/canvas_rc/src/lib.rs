//! The persistent/transient duality used throughout the canvas tree.
//!
//! `Shared<T>` is an immutable, reference-counted, freely-clonable handle
//! (a thin wrapper over `Arc<T>`, which already gives us atomic
//! incref/decref for free). `Owned<T>` is an exclusively-owned, mutable
//! builder; Rust's ownership rules enforce the "only one transient pointer
//! exists at a time" invariant the source engine had to maintain by
//! discipline, so there is nothing extra to check at runtime.
//!
//! `ChildSlot<T>` is the tagged Shared/Owned variant a transient parent
//! uses for children it has not yet needed to mutate: promotion from
//! `Shared` to `Owned` is the "shallow clone, bump the children's
//! refcounts" step (`Owned::from_shared` relies on the parent's `Clone`
//! impl, whose derived behavior clones every `Shared<Child>` field via
//! `Arc::clone`, i.e. an incref).

use std::ops::Deref;
use std::sync::Arc;

/// An immutable, reference-counted, shareable value.
#[derive(Debug)]
pub struct Shared<T>(Arc<T>);

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Shared(Arc::new(value))
    }

    pub fn get(&self) -> &T {
        &self.0
    }

    /// Number of live handles to this value, including `self`.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(a: &Shared<T>, b: &Shared<T>) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Shared(Arc::clone(&self.0))
    }
}

impl<T> Deref for Shared<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: PartialEq> PartialEq for Shared<T> {
    fn eq(&self, other: &Self) -> bool {
        Shared::ptr_eq(self, other) || self.0 == other.0
    }
}

/// An exclusively-owned, mutable builder for `T`. Created either empty
/// (`Owned::new`) or by shallow-cloning a `Shared<T>` (`Owned::from_shared`,
/// the `transient_new` operation).
#[derive(Debug)]
pub struct Owned<T>(T);

impl<T> Owned<T> {
    pub fn new(value: T) -> Self {
        Owned(value)
    }

    pub fn get(&self) -> &T {
        &self.0
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.0
    }

    /// Freezes this transient value back into an immutable, shareable one.
    /// Consuming `self` is what makes "no further mutation after persist"
    /// a compile-time guarantee rather than a runtime flag check.
    pub fn persist(self) -> Shared<T> {
        Shared::new(self.0)
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: Clone> Owned<T> {
    /// Shallow-clones a shared value into a transient one. Any `Shared<Child>`
    /// fields on `T` are incref'd by the derived `Clone` impl, not deep
    /// copied.
    pub fn from_shared(shared: &Shared<T>) -> Self {
        Owned(shared.get().clone())
    }
}

impl<T> Deref for Owned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

/// A child slot that is either still shared with a prior snapshot or has
/// already been promoted to a transient (owned) copy for in-place mutation.
#[derive(Debug)]
pub enum ChildSlot<T> {
    Shared(Shared<T>),
    Owned(Owned<T>),
}

impl<T: Clone> ChildSlot<T> {
    pub fn from_shared(shared: Shared<T>) -> Self {
        ChildSlot::Shared(shared)
    }

    pub fn from_owned(owned: Owned<T>) -> Self {
        ChildSlot::Owned(owned)
    }

    pub fn get(&self) -> &T {
        match self {
            ChildSlot::Shared(s) => s.get(),
            ChildSlot::Owned(o) => o.get(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ChildSlot::Owned(_))
    }

    /// Promotes to `Owned` if not already, then returns a mutable reference.
    /// This is the lazy-promotion point described by the engine: a child is
    /// only cloned the first time a mutation through it is required.
    pub fn promote(&mut self) -> &mut T {
        if let ChildSlot::Shared(shared) = self {
            let owned = Owned::from_shared(shared);
            *self = ChildSlot::Owned(owned);
        }
        match self {
            ChildSlot::Owned(owned) => owned.get_mut(),
            ChildSlot::Shared(_) => unreachable!("just promoted"),
        }
    }

    /// Persists this slot, returning a `Shared<T>` usable by the next
    /// snapshot. If the slot was never promoted, this is just a cheap
    /// clone of the existing handle (an incref), not a deep copy.
    pub fn persist(self) -> Shared<T> {
        match self {
            ChildSlot::Shared(shared) => shared,
            ChildSlot::Owned(owned) => owned.persist(),
        }
    }
}

impl<T: Clone> Clone for ChildSlot<T> {
    fn clone(&self) -> Self {
        match self {
            ChildSlot::Shared(s) => ChildSlot::Shared(s.clone()),
            ChildSlot::Owned(o) => ChildSlot::Owned(Owned::new(o.get().clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_and_drop_leave_refcount_unchanged() {
        let shared = Shared::new(42u32);
        assert_eq!(shared.refcount(), 1);
        let clone = shared.clone();
        assert_eq!(shared.refcount(), 2);
        drop(clone);
        assert_eq!(shared.refcount(), 1);
    }

    #[test]
    fn persist_of_transient_new_matches_structurally() {
        let shared = Shared::new(vec![1, 2, 3]);
        let owned = Owned::from_shared(&shared);
        assert_eq!(owned.get(), shared.get());
        let persisted = owned.persist();
        assert_eq!(persisted.get(), shared.get());
    }

    #[test]
    fn child_slot_promotion_increments_then_mutation_does_not_affect_original() {
        #[derive(Clone, PartialEq, Debug)]
        struct Parent {
            child: Shared<u32>,
        }

        let child = Shared::new(10u32);
        let parent = Shared::new(Parent {
            child: child.clone(),
        });
        assert_eq!(child.refcount(), 2); // held by `child` and by `parent.child`

        let mut slot = ChildSlot::from_shared(parent.get().child.clone());
        assert_eq!(child.refcount(), 3);
        assert!(!slot.is_transient());

        // Promotion shallow-clones `u32`, which has no nested Shared
        // fields, so it doesn't change the original's refcount further.
        *slot.promote() = 99;
        assert!(slot.is_transient());
        assert_eq!(*child.get(), 10);
        assert_eq!(*slot.get(), 99);
    }

    #[test]
    fn child_slot_persist_without_promotion_is_just_an_incref() {
        let shared = Shared::new(5u32);
        let slot = ChildSlot::from_shared(shared.clone());
        assert_eq!(shared.refcount(), 2);
        let persisted = slot.persist();
        assert!(Shared::ptr_eq(&persisted, &shared));
        assert_eq!(shared.refcount(), 2);
    }
}
