//! Source-level location expressions and resolved debug values
//!
//! `Expression` is the pre-DWARF operation list attached to debug values.
//! It keeps a trailing fragment marker separate from the operations so the
//! location reducer can reason about aggregate pieces.

use crate::core::Register;
use gimli::constants::*;
use gimli::DwOp;
use std::cmp::Ordering;

/// Bit-range of an aggregate described by a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentInfo {
    pub offset_bits: u64,
    pub size_bits: u64,
}

impl FragmentInfo {
    pub fn end_bits(&self) -> u64 {
        self.offset_bits + self.size_bits
    }

    pub fn overlaps(&self, other: &FragmentInfo) -> bool {
        self.offset_bits < other.end_bits() && other.offset_bits < self.end_bits()
    }
}

/// One operation of a location expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExprOp {
    /// Operand-less DWARF operation (deref, plus, stack_value, ...)
    Op(DwOp),
    PlusUconst(u64),
    Constu(u64),
    Consts(i64),
    DerefSize(u8),
    /// Value of the following `n` operations at function entry
    EntryValue(u64),
    /// Reference to the n-th operand of a variadic debug value
    Arg(u32),
    Fragment(FragmentInfo),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Expression {
    ops: Vec<ExprOp>,
}

impl Expression {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ops(ops: Vec<ExprOp>) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &[ExprOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn fragment(&self) -> Option<FragmentInfo> {
        match self.ops.last() {
            Some(ExprOp::Fragment(info)) => Some(*info),
            _ => None,
        }
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment().is_some()
    }

    /// Unfragmented expressions overlap everything
    pub fn fragments_overlap(&self, other: &Expression) -> bool {
        match (self.fragment(), other.fragment()) {
            (Some(a), Some(b)) => a.overlaps(&b),
            _ => true,
        }
    }

    /// Operations without the trailing fragment
    pub fn body(&self) -> &[ExprOp] {
        match self.ops.last() {
            Some(ExprOp::Fragment(_)) => &self.ops[..self.ops.len() - 1],
            _ => &self.ops,
        }
    }

    pub fn without_fragment(&self) -> Expression {
        Expression::from_ops(self.body().to_vec())
    }

    pub fn with_fragment(&self, fragment: FragmentInfo) -> Expression {
        let mut ops = self.body().to_vec();
        ops.push(ExprOp::Fragment(fragment));
        Expression { ops }
    }

    /// Value is computed, not stored anywhere
    pub fn is_implicit(&self) -> bool {
        matches!(self.body().last(), Some(ExprOp::Op(op)) if *op == DW_OP_stack_value)
    }

    pub fn is_entry_value(&self) -> bool {
        matches!(self.ops.first(), Some(ExprOp::EntryValue(_)))
    }

    /// Anything beyond a bare fragment
    pub fn is_complex(&self) -> bool {
        !self.body().is_empty()
    }

    /// Inserts operations before any stack-value or fragment marker
    pub fn append(&self, new_ops: &[ExprOp]) -> Expression {
        let mut ops = Vec::with_capacity(self.ops.len() + new_ops.len());
        let mut pending = new_ops;
        for op in &self.ops {
            let is_tail = matches!(op, ExprOp::Fragment(_))
                || matches!(op, ExprOp::Op(o) if *o == DW_OP_stack_value);
            if is_tail {
                ops.extend_from_slice(pending);
                pending = &[];
            }
            ops.push(*op);
        }
        ops.extend_from_slice(pending);
        Expression { ops }
    }

    pub fn with_offset(&self, offset: i64) -> Expression {
        match offset.cmp(&0) {
            Ordering::Greater => self.append(&[ExprOp::PlusUconst(offset as u64)]),
            Ordering::Less => self.append(&[
                ExprOp::Constu(offset.unsigned_abs()),
                ExprOp::Op(DW_OP_minus),
            ]),
            Ordering::Equal => self.clone(),
        }
    }

    pub fn with_stack_value(&self) -> Expression {
        if self.is_implicit() {
            self.clone()
        } else {
            self.append(&[ExprOp::Op(DW_OP_stack_value)])
        }
    }

    /// Composes two call-site parameter expressions, keeping at most one
    /// stack-value marker
    pub fn combine(&self, addition: &Expression) -> Expression {
        let mut elts: Vec<ExprOp> = addition.ops.clone();
        if self.is_implicit() && addition.is_implicit() {
            elts.retain(|op| !matches!(op, ExprOp::Op(o) if *o == DW_OP_stack_value));
        }
        if elts.is_empty() {
            self.clone()
        } else {
            self.append(&elts)
        }
    }

    /// Constant offset folded into a register-relative address
    pub fn leading_offset(&self) -> Option<(i64, &[ExprOp])> {
        let body = self.body();
        match body {
            [ExprOp::PlusUconst(v), rest @ ..] if *v <= i64::MAX as u64 => Some((*v as i64, rest)),
            [ExprOp::Constu(v), ExprOp::Op(op), rest @ ..]
                if *op == DW_OP_minus && *v <= i64::MAX as u64 =>
            {
                Some((-(*v as i64), rest))
            }
            _ => None,
        }
    }
}

/// Machine location of a value: register or memory at register + offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MachineLocation {
    pub reg: Register,
    pub indirect: bool,
    pub offset: i64,
}

impl MachineLocation {
    pub fn register(reg: Register) -> Self {
        Self {
            reg,
            indirect: false,
            offset: 0,
        }
    }

    pub fn memory(reg: Register, offset: i64) -> Self {
        Self {
            reg,
            indirect: true,
            offset,
        }
    }
}

/// One operand of a resolved debug value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbgValueLocEntry {
    Location(MachineLocation),
    Int(i64),
    ConstantFp { bits: u64, bytes: u8 },
    ConstantInt(i64),
    TargetIndex { index: i32, offset: i64 },
}

impl DbgValueLocEntry {
    pub fn is_location(&self) -> bool {
        matches!(self, DbgValueLocEntry::Location(_))
    }
}

/// Resolved value of a variable (or one fragment of it) over a range
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbgValueLoc {
    pub expr: Expression,
    pub values: Vec<DbgValueLocEntry>,
    pub variadic: bool,
}

impl DbgValueLoc {
    pub fn new(expr: Expression, value: DbgValueLocEntry) -> Self {
        Self {
            expr,
            values: vec![value],
            variadic: false,
        }
    }

    pub fn is_fragment(&self) -> bool {
        self.expr.is_fragment()
    }

    pub fn fragment(&self) -> Option<FragmentInfo> {
        self.expr.fragment()
    }

    pub fn is_location(&self) -> bool {
        self.values.iter().any(|v| v.is_location())
    }

    pub fn is_entry_value(&self) -> bool {
        self.expr.is_entry_value()
    }

    /// Unfragmented values sort before fragments, fragments by bit offset
    pub fn fragment_order(&self, other: &DbgValueLoc) -> Ordering {
        let a = self.fragment().map(|f| f.offset_bits);
        let b = other.fragment().map(|f| f.offset_bits);
        a.cmp(&b)
    }
}
