// Copyright 2026 the Dispatch VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reference-counted opaque handles.
//!
//! A [`Ref`] is a nullable, type-tagged handle to a shared payload. Handles
//! move between stack registers and host variant lists with either *retain*
//! (both sides hold a count) or *move* (ownership transfers, no count
//! traffic) semantics. The payload's destructor runs when the last count is
//! released.
//!
//! Counter updates are atomic, so handles may be shared across contexts and
//! threads; a single stack is still only ever mutated by one thread at a
//! time.

use alloc::sync::Arc;
use core::any::Any;
use core::fmt;

/// A small integer tag describing the payload type of a [`Ref`].
///
/// Type ids are assigned by the module that produces the payload; the runtime
/// only compares them. `0` is reserved for the null handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefType(pub u32);

impl RefType {
    /// The type id carried by null handles.
    pub const NULL: Self = Self(0);
}

/// A payload that can be stored behind a [`Ref`].
///
/// Implemented for every `'static + Send + Sync` type; the payload's [`Drop`]
/// is its destructor.
pub trait RefObject: Any + Send + Sync {
    /// Returns the payload as [`Any`] for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> RefObject for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Clone)]
struct RefInner {
    type_id: RefType,
    object: Arc<dyn RefObject>,
}

/// A nullable, atomically refcounted, type-tagged handle.
///
/// The default value is the null handle. Dropping a non-null handle releases
/// one count.
#[derive(Default)]
pub struct Ref {
    inner: Option<RefInner>,
}

impl Ref {
    /// Returns the null handle.
    #[must_use]
    pub const fn null() -> Self {
        Self { inner: None }
    }

    /// Wraps `object` in a new handle with one outstanding count.
    #[must_use]
    pub fn new<T: RefObject>(type_id: RefType, object: T) -> Self {
        Self {
            inner: Some(RefInner {
                type_id,
                object: Arc::new(object),
            }),
        }
    }

    /// Returns `true` if this is the null handle.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// Returns the payload type id ([`RefType::NULL`] for null handles).
    #[must_use]
    pub fn type_id(&self) -> RefType {
        self.inner.as_ref().map_or(RefType::NULL, |i| i.type_id)
    }

    /// Increments the count and returns a second handle to the same payload.
    ///
    /// Retaining the null handle yields the null handle.
    #[must_use]
    pub fn retain(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }

    /// Releases this handle's count and nulls it in place.
    ///
    /// The payload's destructor runs if this was the last count. Releasing a
    /// null handle is a no-op.
    pub fn release(&mut self) {
        self.inner = None;
    }

    /// Returns the number of outstanding counts (`0` for the null handle).
    #[must_use]
    pub fn strong_count(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |i| Arc::strong_count(&i.object))
    }

    /// Returns `true` if both handles are null or share the same payload.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(&a.object, &b.object),
            _ => false,
        }
    }

    /// Downcasts the payload to a concrete type.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.as_ref()?.object.as_any().downcast_ref::<T>()
    }
}

impl Clone for Ref {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl PartialEq for Ref {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => write!(f, "Ref(null)"),
            Some(i) => f
                .debug_struct("Ref")
                .field("type_id", &i.type_id.0)
                .field("count", &Arc::strong_count(&i.object))
                .finish(),
        }
    }
}

/// Transfers `src` into `dst`, honoring move semantics.
///
/// `dst` is released first if non-null. With `is_move` the payload transfers
/// ownership and `src` reads null afterwards; otherwise `src` is retained and
/// both slots hold a count.
///
/// This is the single transfer primitive used by register remapping; the
/// release-then-write ordering is load-bearing and must not be reordered.
pub fn retain_or_move(is_move: bool, src: &mut Ref, dst: &mut Ref) {
    let incoming = if is_move {
        core::mem::take(src)
    } else {
        src.retain()
    };
    // Assignment drops the previous occupant of dst, releasing its count.
    *dst = incoming;
}
