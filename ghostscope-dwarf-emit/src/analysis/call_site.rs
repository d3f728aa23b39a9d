//! Call-site description and parameter value recovery

use crate::core::{
    Callee, DbgValueLoc, DbgValueLocEntry, DebugModule, EmitError, ExprOp, Expression, InstrId,
    LoadedValue, MachineFunction, MachineLocation, Register, Result, TargetInfo,
};
use crate::data::LabelRegistry;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Value of one argument register at the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSiteParam {
    pub register: Register,
    pub value: DbgValueLoc,
}

#[derive(Debug, Clone)]
pub struct CallSite {
    pub instr: InstrId,
    pub callee: Callee,
    pub tail_call: bool,
    pub params: Vec<CallSiteParam>,
}

#[derive(Debug, Clone)]
struct FwdRegParamInfo {
    param_reg: Register,
    expr: Expression,
}

/// Register whose value is still unknown -> parameters depending on it
type FwdRegWorklist = BTreeMap<Register, Vec<FwdRegParamInfo>>;

fn is_describable_call(module: &DebugModule, func: &MachineFunction, instr: InstrId) -> Result<bool> {
    let Some(sp) = func.subprogram else {
        return Ok(false);
    };
    let subprogram = module.subprogram(sp)?;
    let unit = module.compile_unit(subprogram.unit)?;
    let mi = func.instr(instr);
    Ok(unit.emission_kind != crate::core::EmissionKind::NoDebug
        && subprogram.flags.all_calls_described
        && mi.is_call())
}

/// Requests the labels call-site entries reference: the return address of
/// every call, and the branch address of tail calls
pub fn request_call_labels(
    module: &DebugModule,
    func: &MachineFunction,
    registry: &mut LabelRegistry,
) -> Result<()> {
    for id in func.instr_ids() {
        if !is_describable_call(module, func, id)? {
            continue;
        }
        if func.instr(id).flags.tail_call {
            registry.request_before(id);
        }
        registry.request_after(id);
    }
    Ok(())
}

/// Calls of `func` that get a call-site entry, with recovered parameters
/// when `with_params` is set
pub fn collect_call_sites(
    module: &DebugModule,
    func: &MachineFunction,
    target: &dyn TargetInfo,
    with_params: bool,
) -> Result<Vec<CallSite>> {
    let mut sites = Vec::new();
    for id in func.instr_ids() {
        if !is_describable_call(module, func, id)? {
            continue;
        }
        let mi = func.instr(id);
        if mi.flags.frame_setup {
            continue;
        }
        let Some(callee) = mi.callee else {
            trace!("Skipping call {} without a known callee", id.0);
            continue;
        };
        if let Callee::Function(sp) = callee {
            module.subprogram(sp)?;
        }
        let params = if with_params {
            collect_call_site_params(func, id, target)?
        } else {
            Vec::new()
        };
        sites.push(CallSite {
            instr: id,
            callee,
            tail_call: mi.flags.tail_call,
            params,
        });
    }
    debug!("{} call sites in {}", sites.len(), func.name);
    Ok(sites)
}

fn add_to_worklist(
    worklist: &mut FwdRegWorklist,
    reg: Register,
    expr: &Expression,
    params: &[FwdRegParamInfo],
) -> Result<()> {
    let entries = worklist.entry(reg).or_default();
    for param in params {
        if entries.iter().any(|e| e.param_reg == param.param_reg) {
            return Err(EmitError::Invariant(format!(
                "parameter register {} described twice through register {}",
                param.param_reg.0, reg.0
            ))
            .into());
        }
        entries.push(FwdRegParamInfo {
            param_reg: param.param_reg,
            expr: expr.combine(&param.expr),
        });
    }
    Ok(())
}

fn finish_params(
    value: DbgValueLocEntry,
    expr: &Expression,
    described: &[FwdRegParamInfo],
    out: &mut Vec<CallSiteParam>,
) {
    for param in described {
        let combine = !param.expr.is_empty();
        // An entry value cannot be combined with a further expression.
        if combine && expr.is_entry_value() {
            continue;
        }
        let combined = if combine {
            expr.combine(&param.expr)
        } else {
            expr.clone()
        };
        out.push(CallSiteParam {
            register: param.param_reg,
            value: DbgValueLoc::new(combined, value),
        });
    }
}

struct ParamWalker<'a> {
    func: &'a MachineFunction,
    target: &'a dyn TargetInfo,
    worklist: FwdRegWorklist,
    clobbered: Vec<Register>,
    params: Vec<CallSiteParam>,
}

impl ParamWalker<'_> {
    fn is_clobbered(&self, reg: Register) -> bool {
        self.clobbered.iter().any(|c| self.target.regs_overlap(*c, reg))
    }

    /// Returns false when the walk must stop
    fn interpret_next(&mut self, instr: InstrId) -> Result<bool> {
        let mi = self.func.instr(instr);
        if mi.is_call() || self.worklist.is_empty() {
            return Ok(false);
        }
        if mi.is_meta() {
            return Ok(true);
        }
        self.interpret_values(instr)?;
        Ok(true)
    }

    fn interpret_values(&mut self, instr: InstrId) -> Result<()> {
        let mi = self.func.instr(instr);
        let target = self.target;

        let mut fwd_defs: Vec<Register> = Vec::new();
        let mut new_clobbered: Vec<Register> = Vec::new();
        for def in &mi.defs {
            for reg in self.worklist.keys() {
                if target.regs_overlap(*reg, *def) && !fwd_defs.contains(reg) {
                    fwd_defs.push(*reg);
                }
            }
            new_clobbered.push(*def);
        }

        if fwd_defs.is_empty() {
            self.clobbered.extend(new_clobbered);
            return Ok(());
        }

        let sp = target.stack_pointer();
        let fp = target.frame_register(self.func);
        let mut pending = FwdRegWorklist::new();
        for reg in &fwd_defs {
            let Some(loaded) = target.describe_loaded_value(self.func, instr, *reg) else {
                continue;
            };
            let described = self.worklist.get(reg).cloned().unwrap_or_default();
            match loaded.value {
                LoadedValue::Immediate(v) => {
                    finish_params(DbgValueLocEntry::Int(v), &loaded.expr, &described, &mut self.params);
                }
                LoadedValue::Register(src) => {
                    let is_sp_or_fp = src == sp || src == fp;
                    if !self.is_clobbered(src) && (target.is_callee_saved(src) || is_sp_or_fp) {
                        let location = MachineLocation {
                            reg: src,
                            indirect: is_sp_or_fp,
                            offset: 0,
                        };
                        finish_params(
                            DbgValueLocEntry::Location(location),
                            &loaded.expr,
                            &described,
                            &mut self.params,
                        );
                    } else {
                        add_to_worklist(&mut pending, src, &loaded.expr, &described)?;
                    }
                }
            }
        }

        for reg in &fwd_defs {
            self.worklist.remove(reg);
        }
        self.clobbered.extend(new_clobbered);

        let empty = Expression::new();
        for (reg, params) in pending {
            add_to_worklist(&mut self.worklist, reg, &empty, &params)?;
        }
        Ok(())
    }
}

/// Recovers the values of the argument registers of `call` by walking
/// backwards through its block. Registers left undescribed in the entry
/// block fall back to their entry values.
pub fn collect_call_site_params(
    func: &MachineFunction,
    call: InstrId,
    target: &dyn TargetInfo,
) -> Result<Vec<CallSiteParam>> {
    let Some(args) = func.call_site_args.get(&call) else {
        return Ok(Vec::new());
    };

    let mut worklist = FwdRegWorklist::new();
    for arg in args {
        let prev = worklist.insert(
            arg.register,
            vec![FwdRegParamInfo {
                param_reg: arg.register,
                expr: Expression::new(),
            }],
        );
        if prev.is_some() {
            return Err(EmitError::Invariant(format!(
                "register {} forwards two arguments of call {}",
                arg.register.0, call.0
            ))
            .into());
        }
    }

    let block_id = func.block_of(call);
    let block = func.block(block_id);
    let mut walker = ParamWalker {
        func,
        target,
        worklist,
        clobbered: Vec::new(),
        params: Vec::new(),
    };

    // A stopped walk leaves the remaining registers undescribed, so no entry
    // values are produced for them.
    if func.instr(call).flags.has_delay_slot
        && call.0 + 1 < block.end
        && !walker.interpret_next(InstrId(call.0 + 1))?
    {
        return Ok(walker.params);
    }
    for id in (block.first..call.0).rev().map(InstrId) {
        if !walker.interpret_next(id)? {
            return Ok(walker.params);
        }
    }

    if Some(block_id) == func.entry_block() {
        let entry_expr = Expression::from_ops(vec![ExprOp::EntryValue(1)]);
        let remaining = std::mem::take(&mut walker.worklist);
        for (reg, described) in remaining {
            finish_params(
                DbgValueLocEntry::Location(MachineLocation::register(reg)),
                &entry_expr,
                &described,
                &mut walker.params,
            );
        }
    }

    trace!("Call {} has {} described parameters", call.0, walker.params.len());
    Ok(walker.params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ForwardedArg, GenericTarget, MachineInstr, ValueDescription};

    fn load(dest: u16, value: LoadedValue) -> MachineInstr {
        let mut mi = MachineInstr::regular(4, None);
        mi.defs.push(Register(dest));
        mi.describes = Some(ValueDescription {
            dest: Register(dest),
            value,
            offset: 0,
        });
        mi
    }

    fn call_with_args(func: &mut MachineFunction, regs: &[u16]) -> InstrId {
        let call = func
            .push(MachineInstr::call(5, None, Callee::Register(Register(0))))
            .unwrap();
        func.call_site_args.insert(
            call,
            regs.iter()
                .enumerate()
                .map(|(i, r)| ForwardedArg {
                    register: Register(*r),
                    arg_no: i as u16,
                })
                .collect(),
        );
        call
    }

    #[test]
    fn test_immediate_argument() {
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        func.push(load(5, LoadedValue::Immediate(42))).unwrap();
        let call = call_with_args(&mut func, &[5]);
        let params = collect_call_site_params(&func, call, &GenericTarget::x86_64()).unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].register, Register(5));
        assert_eq!(params[0].value.values, vec![DbgValueLocEntry::Int(42)]);
    }

    #[test]
    fn test_copy_chain_through_volatile_register() {
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        // rax = 7; rdi = rax
        func.push(load(0, LoadedValue::Immediate(7))).unwrap();
        func.push(load(5, LoadedValue::Register(Register(0)))).unwrap();
        let call = call_with_args(&mut func, &[5]);
        let params = collect_call_site_params(&func, call, &GenericTarget::x86_64()).unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].value.values, vec![DbgValueLocEntry::Int(7)]);
    }

    #[test]
    fn test_callee_saved_source_is_a_location() {
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        func.push(MachineInstr::regular(1, None)).unwrap();
        func.add_block(0);
        func.add_edge(crate::core::BlockId(0), crate::core::BlockId(1));
        func.push(load(5, LoadedValue::Register(Register(3)))).unwrap();
        let call = call_with_args(&mut func, &[5, 4]);
        let params = collect_call_site_params(&func, call, &GenericTarget::x86_64()).unwrap();
        // rsi stays unknown outside the entry block
        assert_eq!(params.len(), 1);
        assert_eq!(
            params[0].value.values,
            vec![DbgValueLocEntry::Location(MachineLocation::register(Register(3)))]
        );
    }

    #[test]
    fn test_entry_block_falls_back_to_entry_values() {
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        let call = call_with_args(&mut func, &[4]);
        let params = collect_call_site_params(&func, call, &GenericTarget::x86_64()).unwrap();
        assert_eq!(params.len(), 1);
        assert!(params[0].value.expr.is_entry_value());
    }

    #[test]
    fn test_walk_stops_at_previous_call() {
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        func.push(load(5, LoadedValue::Immediate(1))).unwrap();
        func.push(MachineInstr::call(5, None, Callee::Register(Register(0))))
            .unwrap();
        let call = call_with_args(&mut func, &[5]);
        let params = collect_call_site_params(&func, call, &GenericTarget::x86_64()).unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn test_no_entry_value_after_intervening_call() {
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        // rdi = rax; call; call(rdi)
        func.push(load(5, LoadedValue::Register(Register(0)))).unwrap();
        func.push(MachineInstr::call(5, None, Callee::Register(Register(0))))
            .unwrap();
        let call = call_with_args(&mut func, &[5]);
        let params = collect_call_site_params(&func, call, &GenericTarget::x86_64()).unwrap();
        assert!(params.is_empty(), "params: {:?}", params);
    }

    #[test]
    fn test_delay_slot_call_stops_walk() {
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        let mut call_instr = MachineInstr::call(5, None, Callee::Register(Register(0)));
        call_instr.flags.has_delay_slot = true;
        let call = func.push(call_instr).unwrap();
        func.push(MachineInstr::call(4, None, Callee::Register(Register(0))))
            .unwrap();
        func.call_site_args.insert(
            call,
            vec![ForwardedArg {
                register: Register(5),
                arg_no: 0,
            }],
        );
        let params = collect_call_site_params(&func, call, &GenericTarget::x86_64()).unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn test_duplicate_forwarding_register_is_an_error() {
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        let call = call_with_args(&mut func, &[5, 5]);
        assert!(collect_call_site_params(&func, call, &GenericTarget::x86_64()).is_err());
    }
}
