use std::fmt;

use serde::{Deserialize, Serialize};

use crate::define_entity;

use super::ty::Type;

define_entity!(ValueId, "v");

/// A compile-time constant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Constant {
    /// The zero value of `ty`, used for `undef` and tracker seeds.
    pub fn zero(ty: Type) -> Self {
        match ty {
            Type::Bool => Constant::Bool(false),
            Type::Float(_) => Constant::Float(0.0),
            Type::Int(_) | Type::Void => Constant::Int(0),
        }
    }

    pub fn ty(self) -> Type {
        match self {
            Constant::Bool(_) => Type::Bool,
            Constant::Int(_) => Type::Int(64),
            Constant::Float(_) => Type::Float(64),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Bool(b) => write!(f, "{b}"),
            Constant::Int(n) => write!(f, "{n}"),
            Constant::Float(x) => write!(f, "{x:?}"),
        }
    }
}
