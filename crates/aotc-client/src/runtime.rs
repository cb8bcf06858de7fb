//! The live runtime the deserializer resolves records against.

use std::fmt;

use aotc_canon::ClassImage;
use aotc_types::{CompatibilityHeader, RecordKind};

/// A live class loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoaderHandle(pub u64);

/// A live class. Redefinition produces a new handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodHandle(pub u64);

/// An installed calling-convention thunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThunkHandle(pub u64);

impl fmt::Display for LoaderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loader@{:#x}", self.0)
    }
}

impl fmt::Display for ClassHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class@{:#x}", self.0)
    }
}

impl fmt::Display for MethodHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method@{:#x}", self.0)
    }
}

impl fmt::Display for ThunkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thunk@{:#x}", self.0)
    }
}

/// Local representation of a resolved record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalHandle {
    Loader(LoaderHandle),
    Class(ClassHandle),
    Method(MethodHandle),
    /// A verified class chain, represented by its first class.
    ClassChain(ClassHandle),
    WellKnownClasses,
    AotHeader,
    Thunk(ThunkHandle),
}

impl LocalHandle {
    pub const fn as_loader(self) -> Option<LoaderHandle> {
        match self {
            Self::Loader(h) => Some(h),
            _ => None,
        }
    }

    pub const fn as_class(self) -> Option<ClassHandle> {
        match self {
            Self::Class(h) => Some(h),
            _ => None,
        }
    }

    /// Kind of record this handle resolves.
    pub const fn kind(self) -> RecordKind {
        match self {
            Self::Loader(_) => RecordKind::ClassLoader,
            Self::Class(_) => RecordKind::Class,
            Self::Method(_) => RecordKind::Method,
            Self::ClassChain(_) => RecordKind::ClassChain,
            Self::WellKnownClasses => RecordKind::WellKnownClasses,
            Self::AotHeader => RecordKind::AotHeader,
            Self::Thunk(_) => RecordKind::Thunk,
        }
    }

    /// Raw value of the handle, or 0 for kinds without one.
    pub const fn raw(self) -> u64 {
        match self {
            Self::Loader(LoaderHandle(v))
            | Self::Class(ClassHandle(v))
            | Self::ClassChain(ClassHandle(v))
            | Self::Method(MethodHandle(v))
            | Self::Thunk(ThunkHandle(v)) => v,
            Self::WellKnownClasses | Self::AotHeader => 0,
        }
    }
}

impl fmt::Display for LocalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loader(h) => write!(f, "{h}"),
            Self::Class(h) => write!(f, "{h}"),
            Self::Method(h) => write!(f, "{h}"),
            Self::ClassChain(h) => write!(f, "chain({h})"),
            Self::WellKnownClasses => f.write_str("well-known-classes"),
            Self::AotHeader => f.write_str("aot-header"),
            Self::Thunk(h) => write!(f, "{h}"),
        }
    }
}

/// Identity services of the process that consumes cached artifacts.
///
/// Implementations must be callable from several threads at once. The
/// deserializer never holds more than one of its own locks while calling in.
pub trait ClassRuntime: Send + Sync {
    /// The loader that loaded `first_class_name` before any other class.
    fn find_loader(&self, first_class_name: &str) -> Option<LoaderHandle>;

    /// The live class called `name` in `loader`.
    fn find_class(&self, loader: LoaderHandle, name: &str) -> Option<ClassHandle>;

    /// Current image of a live class, for canonical hash verification.
    fn class_image(&self, class: ClassHandle) -> Option<ClassImage>;

    /// `class` followed by its ancestors and interfaces, in chain order.
    fn class_chain(&self, class: ClassHandle) -> Option<Vec<ClassHandle>>;

    /// The method at `index` in `class`.
    fn method(&self, class: ClassHandle, index: u32) -> Option<MethodHandle>;

    /// Header describing this process's code compatibility.
    fn compatibility_header(&self) -> CompatibilityHeader;

    /// Install a thunk, or return the one already installed for `signature`.
    fn install_thunk(&self, signature: &str, code: &[u8]) -> Option<ThunkHandle>;

    /// Whether `handle` still denotes a live entity.
    fn is_live(&self, handle: LocalHandle) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_accessors() {
        let class = LocalHandle::Class(ClassHandle(0x10));
        assert_eq!(class.as_class(), Some(ClassHandle(0x10)));
        assert_eq!(class.as_loader(), None);
        assert_eq!(class.raw(), 0x10);
        assert_eq!(class.kind(), RecordKind::Class);
        assert_eq!(LocalHandle::AotHeader.raw(), 0);
        assert_eq!(class.to_string(), "class@0x10");
        assert_eq!(
            LocalHandle::ClassChain(ClassHandle(1)).to_string(),
            "chain(class@0x1)"
        );
    }
}
