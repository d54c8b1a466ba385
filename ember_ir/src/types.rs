//! Value types.
//!
//! The type system is deliberately small: enough scalar types to express
//! loop counters and call results, an opaque aggregate, and pointer types
//! tagged with an address space. The single property the safepoint
//! machinery cares about is *which pointers the collector manages*:
//! a pointer in address space 1 is a GC pointer, everything else is raw
//! memory the collector never moves.

use std::fmt;

// =============================================================================
// Address Space
// =============================================================================

/// Address space tag carried by pointer types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrSpace(pub u32);

impl AddrSpace {
    /// Ordinary untracked memory.
    pub const DEFAULT: AddrSpace = AddrSpace(0);

    /// The collected heap. Pointers here may be relocated at any safepoint.
    pub const GC: AddrSpace = AddrSpace(1);
}

// =============================================================================
// Pointee Shape
// =============================================================================

/// Shallow description of what a pointer points at.
///
/// This exists so that two GC pointers can have *different* types (object
/// vs. array vs. opaque), which is what forces the base-pointer resolver to
/// emit casts when it merges bases of mismatched shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Elem {
    /// Unknown pointee.
    Opaque,
    /// Raw bytes.
    Byte,
    /// Machine word.
    Word,
    /// A managed object header.
    Object,
    /// A managed array.
    Array,
}

// =============================================================================
// Type
// =============================================================================

/// The type of an SSA value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// No value (calls with no result, stores, terminators).
    Void,
    /// Single-bit condition.
    I1,
    I8,
    I32,
    I64,
    F64,
    /// Opaque aggregate; only usable with field extraction.
    Agg,
    /// Statepoint token, consumed by relocates and result projections.
    Token,
    /// Pointer into `AddrSpace` with a shallow pointee shape.
    Ptr(AddrSpace, Elem),
}

impl Type {
    /// The canonical GC object pointer.
    #[inline]
    pub const fn gc_ptr() -> Type {
        Type::Ptr(AddrSpace::GC, Elem::Object)
    }

    /// A GC pointer with a specific pointee shape.
    #[inline]
    pub const fn gc_ptr_to(elem: Elem) -> Type {
        Type::Ptr(AddrSpace::GC, elem)
    }

    /// An untracked pointer.
    #[inline]
    pub const fn raw_ptr() -> Type {
        Type::Ptr(AddrSpace::DEFAULT, Elem::Opaque)
    }

    #[inline]
    pub const fn is_ptr(self) -> bool {
        matches!(self, Type::Ptr(..))
    }

    /// Is this a pointer the collector may relocate?
    #[inline]
    pub const fn is_gc_ptr(self) -> bool {
        matches!(self, Type::Ptr(space, _) if space.0 == AddrSpace::GC.0)
    }

    #[inline]
    pub const fn is_int(self) -> bool {
        matches!(self, Type::I1 | Type::I8 | Type::I32 | Type::I64)
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Type::F64)
    }

    #[inline]
    pub const fn is_void(self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn addr_space(self) -> Option<AddrSpace> {
        match self {
            Type::Ptr(space, _) => Some(space),
            _ => None,
        }
    }
}

impl Default for Type {
    fn default() -> Self {
        Type::Void
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::I1 => write!(f, "i1"),
            Type::I8 => write!(f, "i8"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::F64 => write!(f, "f64"),
            Type::Agg => write!(f, "agg"),
            Type::Token => write!(f, "token"),
            Type::Ptr(space, elem) => write!(f, "ptr{}({:?})", space.0, elem),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
