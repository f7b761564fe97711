//! Type-tagged value bag.
//!
//! Channels carry opaque session state on behalf of their transport: the
//! protocol version, the security context, the session id. The channel does
//! not know the concrete type, so the bag keys slots by `TypeId` and hands
//! out `Arc`s of the stored value. Mutation happens only during handshake;
//! the stored types guard their own interiors.

use std::any::{Any, TypeId};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

/// A bag of at most one value per type.
#[derive(Default)]
pub struct AnyBag {
    slots: Mutex<FxHashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl AnyBag {
    /// Creates an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, replacing any previous value of the same type.
    pub fn set<T: Any + Send + Sync>(&self, value: T) {
        let mut slots = self.slots.lock().expect("any-bag lock poisoned");
        slots.insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Returns the stored value of type `T`, if any.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let slots = self.slots.lock().expect("any-bag lock poisoned");
        slots
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    /// Removes and returns the stored value of type `T`, if any.
    pub fn take<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let mut slots = self.slots.lock().expect("any-bag lock poisoned");
        slots
            .remove(&TypeId::of::<T>())
            .and_then(|any| any.downcast::<T>().ok())
    }

    /// Drops every stored value.
    pub fn clear(&self) {
        self.slots.lock().expect("any-bag lock poisoned").clear();
    }
}

impl std::fmt::Debug for AnyBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.slots.lock().map(|slots| slots.len()).unwrap_or(0);
        f.debug_struct("AnyBag").field("slots", &len).finish()
    }
}
