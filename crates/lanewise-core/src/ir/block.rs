use serde::{Deserialize, Serialize};

use crate::define_entity;

use super::inst::InstId;
use super::ty::Type;
use super::value::ValueId;

define_entity!(BlockId, "block");

/// A block parameter. Parameters play the role of phi nodes: the value on
/// entry is the argument passed by whichever predecessor branched here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockParam {
    pub value: ValueId,
    pub ty: Type,
}

/// A basic block: parameters followed by instructions, the last of which is
/// the terminator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Block {
    pub params: Vec<BlockParam>,
    pub insts: Vec<InstId>,
}
