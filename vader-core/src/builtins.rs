//! Built-in intrinsics of the Vader language.
//!
//! Intrinsics are callables whose lowering lives in the code generator.
//! This module only describes them; it performs no I/O or wasm interaction
//! itself. The resolver consults the table when a call target is not found
//! in scope, and `@intrinsic` declarations re-bind one of these names
//! explicitly.

/// Kind tag used by the resolver (for typing) and the backend (for lowering).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicKind {
    /// Writes the bytes of a string literal to the host's output stream.
    Print,
    /// Forwards its integer argument to the host's process-termination call.
    Exit,
    /// Reads the built-in length field of an array heap value.
    Length,
}

/// Metadata about a single intrinsic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinDescriptor {
    /// Name at the Vader level.
    pub name: &'static str,
    /// Kind tag for resolver and backend dispatch.
    pub kind: IntrinsicKind,
    /// Host import module backing the lowering, if any.
    pub host_module: Option<&'static str>,
}

/// The complete list of intrinsics known to the core.
pub const BUILTINS: &[BuiltinDescriptor] = &[
    BuiltinDescriptor {
        name: "print",
        kind: IntrinsicKind::Print,
        host_module: Some("wasi_snapshot_preview1"),
    },
    BuiltinDescriptor {
        name: "exit",
        kind: IntrinsicKind::Exit,
        host_module: Some("wasi_snapshot_preview1"),
    },
    BuiltinDescriptor {
        name: "length",
        kind: IntrinsicKind::Length,
        host_module: None,
    },
];

/// Look up an intrinsic by name. Linear scan; the table is small.
pub fn find_builtin(name: &str) -> Option<&'static BuiltinDescriptor> {
    BUILTINS.iter().find(|b| b.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_known_intrinsics() {
        assert_eq!(find_builtin("print").unwrap().kind, IntrinsicKind::Print);
        assert_eq!(find_builtin("exit").unwrap().kind, IntrinsicKind::Exit);
        assert_eq!(find_builtin("length").unwrap().kind, IntrinsicKind::Length);
        assert!(find_builtin("memcpy").is_none());
    }
}
