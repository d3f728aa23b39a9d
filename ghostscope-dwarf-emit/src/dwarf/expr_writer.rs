//! Lowers resolved debug values to DWARF expression bytes
//!
//! One writer produces one expression: a location attribute, one range of a
//! location list, or a call-site value. Fragments of an aggregate are
//! written back to back with `DW_OP_piece`, padding gaps with empty pieces.
//! Every `add_*` call reports whether the value could be described; callers
//! drop the whole expression when it could not.

use crate::analysis::FrameSlot;
use crate::core::{
    DbgValueLoc, DbgValueLocEntry, EmitOptions, ExprOp, Expression, FragmentInfo, Label,
    MachineLocation, Register, Result, TargetInfo,
};
use crate::dwarf::die::LocBlock;
use gimli::constants::*;
use gimli::write::{EndianVec, Writer};
use gimli::{DwOp, RunTimeEndian};
use tracing::trace;

/// How an expression refers to a relocatable address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressOperand {
    Direct(Label),
    /// Slot in the address pool
    Index(u32),
}

pub struct ExprWriter<'a> {
    options: &'a EmitOptions,
    target: &'a dyn TargetInfo,
    out: EndianVec<RunTimeEndian>,
    addresses: Vec<(usize, Label)>,
    offset_in_bits: u64,
    /// Writing `DW_AT_call_value`: values are computed, never located
    call_site_value: bool,
}

impl<'a> ExprWriter<'a> {
    pub fn new(options: &'a EmitOptions, target: &'a dyn TargetInfo) -> Self {
        Self {
            options,
            target,
            out: EndianVec::new(options.endian),
            addresses: Vec::new(),
            offset_in_bits: 0,
            call_site_value: false,
        }
    }

    pub fn for_call_site_value(options: &'a EmitOptions, target: &'a dyn TargetInfo) -> Self {
        Self {
            call_site_value: true,
            ..Self::new(options, target)
        }
    }

    pub fn finish(self) -> LocBlock {
        LocBlock {
            bytes: self.out.into_vec(),
            addresses: self.addresses,
        }
    }

    fn op(&mut self, op: DwOp) -> Result<()> {
        self.out.write_u8(op.0)?;
        Ok(())
    }

    fn dwarf_reg(&self, reg: Register) -> Option<u16> {
        let num = self.target.dwarf_register(reg);
        if num.is_none() {
            trace!("Register {} has no DWARF number", reg.0);
        }
        num
    }

    fn reg_op(&mut self, num: u16) -> Result<()> {
        if num < 32 {
            self.out.write_u8(DW_OP_reg0.0 + num as u8)?;
        } else {
            self.op(DW_OP_regx)?;
            self.out.write_uleb128(num as u64)?;
        }
        Ok(())
    }

    fn breg_op(&mut self, num: u16, offset: i64) -> Result<()> {
        if num < 32 {
            self.out.write_u8(DW_OP_breg0.0 + num as u8)?;
        } else {
            self.op(DW_OP_bregx)?;
            self.out.write_uleb128(num as u64)?;
        }
        self.out.write_sleb128(offset)?;
        Ok(())
    }

    fn unsigned_constant(&mut self, value: u64) -> Result<()> {
        if value < 32 {
            self.out.write_u8(DW_OP_lit0.0 + value as u8)?;
        } else if value == u64::MAX {
            self.op(DW_OP_lit0)?;
            self.op(DW_OP_not)?;
        } else {
            self.op(DW_OP_constu)?;
            self.out.write_uleb128(value)?;
        }
        Ok(())
    }

    fn signed_constant(&mut self, value: i64) -> Result<()> {
        if value >= 0 {
            return self.unsigned_constant(value as u64);
        }
        self.op(DW_OP_consts)?;
        self.out.write_sleb128(value)?;
        Ok(())
    }

    fn constant(&mut self, value: i64, signed: bool) -> Result<()> {
        if signed {
            self.signed_constant(value)
        } else {
            self.unsigned_constant(value as u64)
        }
    }

    /// Marks the value as computed; not available before DWARF v4
    fn stack_value(&mut self) -> Result<()> {
        if self.call_site_value || self.options.version() < 4 {
            return Ok(());
        }
        self.op(DW_OP_stack_value)
    }

    fn piece(&mut self, size_bits: u64) -> Result<()> {
        if size_bits % 8 == 0 {
            self.op(DW_OP_piece)?;
            self.out.write_uleb128(size_bits / 8)?;
        } else {
            self.op(DW_OP_bit_piece)?;
            self.out.write_uleb128(size_bits)?;
            self.out.write_uleb128(0)?;
        }
        Ok(())
    }

    fn begin_fragment(&mut self, fragment: Option<FragmentInfo>) -> Result<()> {
        if let Some(fragment) = fragment {
            if fragment.offset_bits > self.offset_in_bits {
                self.piece(fragment.offset_bits - self.offset_in_bits)?;
            }
        }
        Ok(())
    }

    fn end_fragment(&mut self, fragment: Option<FragmentInfo>) -> Result<()> {
        if let Some(fragment) = fragment {
            self.piece(fragment.size_bits)?;
            self.offset_in_bits = fragment.end_bits();
        }
        Ok(())
    }

    /// Writes `ops`, resolving `DW_OP_LLVM_arg` references against `args`
    fn lower_ops(&mut self, ops: &[ExprOp], args: &[DbgValueLocEntry], signed: bool) -> Result<bool> {
        for op in ops {
            match *op {
                ExprOp::Op(op) if op == DW_OP_stack_value => self.stack_value()?,
                ExprOp::Op(op) => self.op(op)?,
                ExprOp::PlusUconst(v) => {
                    self.op(DW_OP_plus_uconst)?;
                    self.out.write_uleb128(v)?;
                }
                ExprOp::Constu(v) => self.unsigned_constant(v)?,
                ExprOp::Consts(v) => {
                    self.op(DW_OP_consts)?;
                    self.out.write_sleb128(v)?;
                }
                ExprOp::DerefSize(size) => {
                    self.op(DW_OP_deref_size)?;
                    self.out.write_u8(size)?;
                }
                ExprOp::Arg(idx) => {
                    let Some(arg) = args.get(idx as usize) else {
                        return Ok(false);
                    };
                    if !self.push_operand(arg, signed)? {
                        return Ok(false);
                    }
                }
                // Entry values only lead an expression.
                ExprOp::EntryValue(_) => return Ok(false),
                ExprOp::Fragment(_) => {}
            }
        }
        Ok(true)
    }

    /// Pushes the value of one operand of a variadic expression
    fn push_operand(&mut self, arg: &DbgValueLocEntry, signed: bool) -> Result<bool> {
        match *arg {
            DbgValueLocEntry::Location(loc) => {
                let Some(num) = self.dwarf_reg(loc.reg) else {
                    return Ok(false);
                };
                self.breg_op(num, if loc.indirect { loc.offset } else { 0 })?;
            }
            DbgValueLocEntry::Int(v) | DbgValueLocEntry::ConstantInt(v) => self.constant(v, signed)?,
            DbgValueLocEntry::ConstantFp { bits, bytes } if bytes <= 8 => {
                self.unsigned_constant(bits)?
            }
            DbgValueLocEntry::ConstantFp { .. } | DbgValueLocEntry::TargetIndex { .. } => {
                return Ok(false)
            }
        }
        Ok(true)
    }

    fn entry_value_op(&mut self, reg: Register) -> Result<bool> {
        let Some(num) = self.dwarf_reg(reg) else {
            return Ok(false);
        };
        let op = if self.options.use_gnu_analog_for_dwarf5() {
            DW_OP_GNU_entry_value
        } else {
            DW_OP_entry_value
        };
        self.op(op)?;
        let inner = if num < 32 { 1 } else { 1 + uleb_len(num as u64) };
        self.out.write_uleb128(inner)?;
        self.reg_op(num)?;
        Ok(true)
    }

    /// Location at `loc` followed by the expression body
    fn machine_location(&mut self, loc: MachineLocation, expr: &Expression) -> Result<bool> {
        let Some(num) = self.dwarf_reg(loc.reg) else {
            return Ok(false);
        };
        let body = expr.body();
        if !loc.indirect && body.is_empty() && !self.call_site_value {
            self.reg_op(num)?;
            return Ok(true);
        }
        let (offset, rest) = expr.leading_offset().unwrap_or((0, body));
        let base = if loc.indirect { loc.offset } else { 0 };
        self.breg_op(num, base + offset)?;
        self.lower_ops(rest, &[], false)
    }

    /// One value, possibly a fragment of its variable
    pub fn add_value(&mut self, value: &DbgValueLoc, signed: bool) -> Result<bool> {
        let fragment = value.fragment();
        self.begin_fragment(fragment)?;
        let body = value.expr.body();

        let described = if value.is_entry_value() {
            match value.values.as_slice() {
                [DbgValueLocEntry::Location(loc)] if !loc.indirect => {
                    self.entry_value_op(loc.reg)?
                        && self.lower_ops(&body[1..], &[], signed)?
                        && self.finish_implicit(&value.expr)?
                }
                _ => false,
            }
        } else if value.variadic {
            self.lower_ops(body, &value.values, signed)?
        } else {
            match value.values.first() {
                None => false,
                Some(DbgValueLocEntry::Location(loc)) => self.machine_location(*loc, &value.expr)?,
                Some(DbgValueLocEntry::Int(v)) | Some(DbgValueLocEntry::ConstantInt(v)) => {
                    self.constant(*v, signed)?;
                    self.lower_ops(body, &[], signed)? && self.finish_implicit(&value.expr)?
                }
                Some(DbgValueLocEntry::ConstantFp { bits, bytes }) => {
                    self.constant_fp(*bits, *bytes, &value.expr)?
                }
                Some(DbgValueLocEntry::TargetIndex { index, offset }) => {
                    self.op(DW_OP_WASM_location)?;
                    self.out.write_uleb128(*index as u64)?;
                    self.out.write_uleb128(*offset as u64)?;
                    self.lower_ops(body, &[], signed)?
                }
            }
        };
        if !described {
            return Ok(false);
        }
        self.end_fragment(fragment)?;
        Ok(true)
    }

    fn finish_implicit(&mut self, expr: &Expression) -> Result<bool> {
        if !expr.is_implicit() {
            self.stack_value()?;
        }
        Ok(true)
    }

    fn constant_fp(&mut self, bits: u64, bytes: u8, expr: &Expression) -> Result<bool> {
        let body = expr.body();
        if self.options.version() >= 4 && !self.options.tune_for_sce() && body.is_empty() && !self.call_site_value {
            self.op(DW_OP_implicit_value)?;
            self.out.write_uleb128(bytes as u64)?;
            self.out.write_udata(bits, bytes.min(8))?;
            return Ok(true);
        }
        if bytes > 8 {
            return Ok(false);
        }
        self.unsigned_constant(bits)?;
        Ok(self.lower_ops(body, &[], false)? && self.finish_implicit(expr)?)
    }

    /// Values of one location-list range, fragments sorted by offset
    pub fn add_values(&mut self, values: &[DbgValueLoc], signed: bool) -> Result<bool> {
        for value in values {
            if !self.add_value(value, signed)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn add_frame_slots(&mut self, slots: &[FrameSlot]) -> Result<bool> {
        for slot in slots {
            let fragment = slot.expr.fragment();
            self.begin_fragment(fragment)?;
            if !self.machine_location(slot.location, &slot.expr)? {
                return Ok(false);
            }
            self.end_fragment(fragment)?;
        }
        Ok(true)
    }

    pub fn add_entry_values(&mut self, regs: &[(Register, Expression)]) -> Result<bool> {
        for (reg, expr) in regs {
            let fragment = expr.fragment();
            self.begin_fragment(fragment)?;
            let body = match expr.body() {
                [ExprOp::EntryValue(_), rest @ ..] => rest,
                body => body,
            };
            if !self.entry_value_op(*reg)? || !self.lower_ops(body, &[], false)? {
                return Ok(false);
            }
            if !expr.is_implicit() {
                self.stack_value()?;
            }
            self.end_fragment(fragment)?;
        }
        Ok(true)
    }

    /// Bare register location, used by call-site parameters and targets
    pub fn add_register(&mut self, reg: Register) -> Result<bool> {
        let Some(num) = self.dwarf_reg(reg) else {
            return Ok(false);
        };
        self.reg_op(num)?;
        Ok(true)
    }

    /// Address of a global, optionally thread-local, followed by `expr`
    pub fn add_address(&mut self, address: AddressOperand, tls: bool, expr: &Expression) -> Result<bool> {
        let size = self.options.address_size();
        match (address, tls) {
            (AddressOperand::Direct(label), false) => {
                self.op(DW_OP_addr)?;
                self.placeholder(label, size)?;
            }
            (AddressOperand::Direct(label), true) => {
                self.op(if size == 4 { DW_OP_const4u } else { DW_OP_const8u })?;
                self.placeholder(label, size)?;
            }
            (AddressOperand::Index(idx), false) => {
                self.op(if self.options.version() >= 5 {
                    DW_OP_addrx
                } else {
                    DW_OP_GNU_addr_index
                })?;
                self.out.write_uleb128(idx as u64)?;
            }
            (AddressOperand::Index(idx), true) => {
                self.op(if self.options.version() >= 5 {
                    DW_OP_constx
                } else {
                    DW_OP_GNU_const_index
                })?;
                self.out.write_uleb128(idx as u64)?;
            }
        }
        if tls {
            self.op(if self.options.use_gnu_tls_opcode {
                DW_OP_GNU_push_tls_address
            } else {
                DW_OP_form_tls_address
            })?;
        }
        let fragment = expr.fragment();
        if !self.lower_ops(expr.body(), &[], false)? {
            return Ok(false);
        }
        self.end_fragment(fragment)?;
        Ok(true)
    }

    fn placeholder(&mut self, label: Label, size: u8) -> Result<()> {
        self.addresses.push((self.out.len(), label));
        self.out.write_udata(0, size)?;
        Ok(())
    }
}

fn uleb_len(mut value: u64) -> u64 {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EmitterConfig, GenericTarget};

    fn options(version: u16) -> EmitOptions {
        EmitterConfig::with_version(version).resolve().unwrap()
    }

    fn frag(offset_bits: u64, size_bits: u64) -> ExprOp {
        ExprOp::Fragment(FragmentInfo {
            offset_bits,
            size_bits,
        })
    }

    #[test]
    fn test_register_and_memory_locations() {
        let options = options(4);
        let target = GenericTarget::x86_64();

        let mut writer = ExprWriter::new(&options, &target);
        let value = DbgValueLoc::new(
            Expression::new(),
            DbgValueLocEntry::Location(MachineLocation::register(Register(5))),
        );
        assert!(writer.add_value(&value, false).unwrap());
        assert_eq!(writer.finish().bytes, vec![DW_OP_reg5.0]);

        let mut writer = ExprWriter::new(&options, &target);
        let value = DbgValueLoc::new(
            Expression::new().with_offset(-8),
            DbgValueLocEntry::Location(MachineLocation::memory(Register(6), 0)),
        );
        assert!(writer.add_value(&value, false).unwrap());
        assert_eq!(writer.finish().bytes, vec![DW_OP_breg6.0, 0x78]);
    }

    #[test]
    fn test_constants_are_implicit() {
        let options = options(4);
        let target = GenericTarget::x86_64();
        let mut writer = ExprWriter::new(&options, &target);
        let value = DbgValueLoc::new(Expression::new(), DbgValueLocEntry::Int(-3));
        assert!(writer.add_value(&value, true).unwrap());
        assert_eq!(
            writer.finish().bytes,
            vec![DW_OP_consts.0, 0x7d, DW_OP_stack_value.0]
        );

        let mut writer = ExprWriter::new(&options, &target);
        let value = DbgValueLoc::new(Expression::new(), DbgValueLocEntry::Int(7));
        assert!(writer.add_value(&value, false).unwrap());
        assert_eq!(
            writer.finish().bytes,
            vec![DW_OP_lit7.0, DW_OP_stack_value.0]
        );
    }

    #[test]
    fn test_float_uses_implicit_value() {
        let options = options(4);
        let target = GenericTarget::x86_64();
        let mut writer = ExprWriter::new(&options, &target);
        let value = DbgValueLoc::new(
            Expression::new(),
            DbgValueLocEntry::ConstantFp {
                bits: 0x3f80_0000,
                bytes: 4,
            },
        );
        assert!(writer.add_value(&value, false).unwrap());
        assert_eq!(
            writer.finish().bytes,
            vec![DW_OP_implicit_value.0, 4, 0x00, 0x00, 0x80, 0x3f]
        );
    }

    #[test]
    fn test_fragments_pad_gaps() {
        let options = options(4);
        let target = GenericTarget::x86_64();
        let mut writer = ExprWriter::new(&options, &target);
        let values = vec![
            DbgValueLoc::new(
                Expression::from_ops(vec![frag(0, 32)]),
                DbgValueLocEntry::Location(MachineLocation::register(Register(0))),
            ),
            DbgValueLoc::new(
                Expression::from_ops(vec![frag(64, 32)]),
                DbgValueLocEntry::Location(MachineLocation::register(Register(1))),
            ),
        ];
        assert!(writer.add_values(&values, false).unwrap());
        assert_eq!(
            writer.finish().bytes,
            vec![
                DW_OP_reg0.0,
                DW_OP_piece.0,
                4,
                DW_OP_piece.0,
                4,
                DW_OP_reg1.0,
                DW_OP_piece.0,
                4
            ]
        );
    }

    #[test]
    fn test_entry_value_in_call_site_value() {
        let options = options(5);
        let target = GenericTarget::x86_64();
        let mut writer = ExprWriter::for_call_site_value(&options, &target);
        let value = DbgValueLoc::new(
            Expression::from_ops(vec![ExprOp::EntryValue(1)]),
            DbgValueLocEntry::Location(MachineLocation::register(Register(5))),
        );
        assert!(writer.add_value(&value, false).unwrap());
        assert_eq!(
            writer.finish().bytes,
            vec![DW_OP_entry_value.0, 1, DW_OP_reg5.0]
        );

        let gnu = options_gnu();
        let mut writer = ExprWriter::for_call_site_value(&gnu, &target);
        assert!(writer.add_value(&value, false).unwrap());
        assert_eq!(writer.finish().bytes[0], DW_OP_GNU_entry_value.0);
    }

    fn options_gnu() -> EmitOptions {
        options(4)
    }

    #[test]
    fn test_global_address_placeholder() {
        let options = options(4);
        let target = GenericTarget::x86_64();
        let mut writer = ExprWriter::new(&options, &target);
        assert!(writer
            .add_address(AddressOperand::Direct(Label(9)), false, &Expression::new())
            .unwrap());
        let block = writer.finish();
        assert_eq!(block.len(), 9);
        assert_eq!(block.addresses, vec![(1, Label(9))]);
    }
}
