use std::fmt;

use serde::{Deserialize, Serialize};

/// Scalar IR type. Vector width is never part of the type: the whole
/// function is executed lane-parallel by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Void,
    Bool,
    Int(u16),
    Float(u16),
}

impl Type {
    pub fn is_bool(self) -> bool {
        matches!(self, Type::Bool)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Bool => write!(f, "bool"),
            Type::Int(bits) => write!(f, "i{bits}"),
            Type::Float(bits) => write!(f, "f{bits}"),
        }
    }
}

/// Function signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSig {
    pub params: Vec<Type>,
    pub return_ty: Type,
}

impl Default for FunctionSig {
    fn default() -> Self {
        Self {
            params: Vec::new(),
            return_ty: Type::Void,
        }
    }
}
