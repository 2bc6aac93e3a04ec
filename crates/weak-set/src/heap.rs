//! The narrow view of the host heap that weak sets consume.
//!
//! A weak set never dereferences the objects it tracks. It only stores their
//! addresses, asks the collector whether they were marked, and (while weak
//! visiting) asks it to mark them.

use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroUsize;

/// Address of an object in the host heap.
///
/// This is deliberately a plain address and not a smart pointer: holding a
/// `HeapRef` never keeps the object alive and dropping one does nothing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct HeapRef(NonZeroUsize);

impl HeapRef {
    /// Wraps a raw address. Returns `None` for the null address.
    #[must_use]
    pub const fn new(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Wraps an object pointer. Returns `None` for null.
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Option<Self> {
        Self::new(ptr as usize)
    }

    /// The raw address.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    /// The address as a typed pointer. Dereferencing it is the caller's
    /// business; nothing here guarantees the object still exists.
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0.get() as *const T
    }
}

impl fmt::Debug for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapRef({:#x})", self.0)
    }
}

/// Opaque pointer-sized value handed back to a handle's owner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct WeakContext(usize);

impl WeakContext {
    /// The empty context.
    pub const NONE: Self = Self(0);

    /// Wraps an opaque value.
    #[must_use]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    /// Wraps a pointer as context.
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// The raw context value.
    #[must_use]
    pub const fn value(self) -> usize {
        self.0
    }

    /// The context as a pointer, for contexts built with `from_ptr`.
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Whether this is [`WeakContext::NONE`].
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// The collector's answer to "did this object survive marking?".
pub trait Liveness {
    /// Whether `target` was marked live in the current cycle.
    fn is_marked(&self, target: HeapRef) -> bool;
}

impl<F> Liveness for F
where
    F: Fn(HeapRef) -> bool,
{
    fn is_marked(&self, target: HeapRef) -> bool {
        self(target)
    }
}

/// Marking capability lent to owners while weak sets are visited.
pub trait MarkVisitor: Liveness {
    /// Marks `target` live. The collector is responsible for tracing
    /// whatever the object references.
    fn mark(&mut self, target: HeapRef);

    /// Whether `root` was reached as an opaque root during this cycle.
    fn contains_opaque_root(&self, root: WeakContext) -> bool {
        let _ = root;
        false
    }
}

/// A hash-set mark state, for hosts without their own mark bitmap and for
/// driving weak sets in isolation.
#[derive(Debug, Default, Clone)]
pub struct MarkSet {
    marked: HashSet<HeapRef>,
    opaque_roots: HashSet<WeakContext>,
}

impl MarkSet {
    /// An empty mark set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an opaque root reached during marking.
    pub fn add_opaque_root(&mut self, root: WeakContext) {
        self.opaque_roots.insert(root);
    }

    /// Forgets every mark and opaque root.
    pub fn clear(&mut self) {
        self.marked.clear();
        self.opaque_roots.clear();
    }

    /// Marked objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.marked.len()
    }

    /// Nothing is marked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.marked.is_empty()
    }
}

impl Liveness for MarkSet {
    fn is_marked(&self, target: HeapRef) -> bool {
        self.marked.contains(&target)
    }
}

impl MarkVisitor for MarkSet {
    fn mark(&mut self, target: HeapRef) {
        self.marked.insert(target);
    }

    fn contains_opaque_root(&self, root: WeakContext) -> bool {
        self.opaque_roots.contains(&root)
    }
}

impl Extend<HeapRef> for MarkSet {
    fn extend<I: IntoIterator<Item = HeapRef>>(&mut self, iter: I) {
        self.marked.extend(iter);
    }
}

impl FromIterator<HeapRef> for MarkSet {
    fn from_iter<I: IntoIterator<Item = HeapRef>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}
