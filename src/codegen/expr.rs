//! Expression Emitter
//!
//! Every expression leaves its value in a scratch register taken from the
//! LIFO pool. Operands are evaluated left to right; binary operators compute
//! into the left register and release the right one.

use crate::error::{CompileError, Result};
use crate::model::{BinaryOperator, Builtin, Expr, ExprType, UnaryOperator};
use crate::x64::inst::{AluOp, Cond, Inst, Mem, Rm, ShiftAmount, ShiftOp, UnaryOp};
use crate::x64::registers::{Reg64, MESSAGE_REG, STATE_BASE_REG};

use super::{CallArg, CodegenContext, FunctionBuilder, Value};

/// Buffer size of `read_input()` without an argument
pub const DEFAULT_READ_MAX: i64 = 4096;

/// Fail unless `value` has type `want`
pub fn expect(fb: &FunctionBuilder, value: Value, want: ExprType, what: &str) -> Result<()> {
    if value.ty != want {
        return Err(CompileError::type_error(
            format!("{} in {}", what, fb.name),
            format!("expected {}, found {}", want, value.ty),
        ));
    }
    Ok(())
}

/// Evaluate `expr` into a fresh scratch register
pub fn emit_expr(ctx: &mut CodegenContext, fb: &mut FunctionBuilder, expr: &Expr) -> Result<Value> {
    match expr {
        Expr::Int { value } => emit_int(ctx, fb, *value),
        Expr::Bool { value } => {
            let reg = fb.alloc()?;
            fb.emit(Inst::mov(reg, *value as i64));
            Ok(Value {
                reg,
                ty: ExprType::Bool,
            })
        }
        Expr::Str { value } => {
            let sym = ctx.intern_str(value)?;
            let reg = fb.alloc()?;
            fb.emit(Inst::lea(reg, Mem::sym(sym, 0)));
            Ok(Value {
                reg,
                ty: ExprType::Str,
            })
        }
        Expr::State { field } => {
            let slot = fb.agent.state.field(field).ok_or_else(|| {
                CompileError::reference(
                    format!("state field `{}` in {}", field, fb.name),
                    format!("`{}` has no such field", fb.agent.name),
                )
            })?;
            let (offset, ty) = (slot.offset as i32, slot.ty);
            let reg = fb.alloc()?;
            fb.load(reg, Mem::disp(STATE_BASE_REG, offset), ty);
            Ok(Value {
                reg,
                ty: ty.expr_type(),
            })
        }
        Expr::Field { field } => {
            let schema = fb.message.ok_or_else(|| {
                CompileError::reference(
                    format!("message field `{}` in {}", field, fb.name),
                    "helpers have no inbound message",
                )
            })?;
            let slot = schema.record.field(field).ok_or_else(|| {
                CompileError::reference(
                    format!("message field `{}` in {}", field, fb.name),
                    format!("not a field of `{}`", schema.name),
                )
            })?;
            let (offset, ty) = (slot.offset as i32, slot.ty);
            let reg = fb.alloc()?;
            fb.load(reg, Mem::disp(MESSAGE_REG, offset), ty);
            Ok(Value {
                reg,
                ty: ty.expr_type(),
            })
        }
        Expr::Local { name } => {
            let local = fb.lookup_local(name).ok_or_else(|| {
                CompileError::reference(format!("local `{}` in {}", name, fb.name), "not declared")
            })?;
            let reg = fb.alloc()?;
            fb.emit(Inst::mov(reg, FunctionBuilder::local_mem(local.slot)));
            Ok(Value { reg, ty: local.ty })
        }
        Expr::Unary { op, operand } => {
            let value = emit_expr(ctx, fb, operand)?;
            match op {
                UnaryOperator::Neg => {
                    expect(fb, value, ExprType::Int, "operand of `neg`")?;
                    fb.emit(Inst::Unary {
                        op: UnaryOp::Neg,
                        dst: Rm::Reg(value.reg),
                    });
                }
                UnaryOperator::BitNot => {
                    expect(fb, value, ExprType::Int, "operand of `bit_not`")?;
                    fb.emit(Inst::Unary {
                        op: UnaryOp::Not,
                        dst: Rm::Reg(value.reg),
                    });
                }
                UnaryOperator::Not => {
                    expect(fb, value, ExprType::Bool, "operand of `not`")?;
                    fb.emit(Inst::alu(AluOp::Xor, value.reg, 1));
                }
            }
            Ok(value)
        }
        Expr::Binary { op, lhs, rhs } => emit_binary(ctx, fb, *op, lhs, rhs),
        Expr::Builtin { name, args } => emit_builtin(ctx, fb, *name, args),
        Expr::Call { helper, args } => emit_helper_call(ctx, fb, helper, args),
    }
}

fn emit_int(ctx: &mut CodegenContext, fb: &mut FunctionBuilder, value: i64) -> Result<Value> {
    let reg = fb.alloc()?;
    if i32::try_from(value).is_ok() {
        fb.emit(Inst::mov(reg, value));
    } else {
        let sym = ctx.intern_i64(value)?;
        fb.emit(Inst::mov(reg, Mem::sym(sym, 0)));
    }
    Ok(Value {
        reg,
        ty: ExprType::Int,
    })
}

fn comparison(op: BinaryOperator) -> Option<Cond> {
    match op {
        BinaryOperator::Eq => Some(Cond::E),
        BinaryOperator::Ne => Some(Cond::NE),
        BinaryOperator::Lt => Some(Cond::L),
        BinaryOperator::Le => Some(Cond::LE),
        BinaryOperator::Gt => Some(Cond::G),
        BinaryOperator::Ge => Some(Cond::GE),
        _ => None,
    }
}

fn emit_binary(
    ctx: &mut CodegenContext,
    fb: &mut FunctionBuilder,
    op: BinaryOperator,
    lhs: &Expr,
    rhs: &Expr,
) -> Result<Value> {
    let a = emit_expr(ctx, fb, lhs)?;
    let b = emit_expr(ctx, fb, rhs)?;
    let what = format!("operands of `{:?}`", op).to_lowercase();

    if a.ty != b.ty {
        return Err(CompileError::type_error(
            format!("{} in {}", what, fb.name),
            format!("{} and {} do not match", a.ty, b.ty),
        ));
    }

    // Strings only support concatenation and (in)equality
    if a.ty == ExprType::Str {
        fb.free(b.reg);
        fb.free(a.reg);
        return match op {
            BinaryOperator::Add => {
                fb.emit_call_value(ctx.rt.concat, &[CallArg::Reg(a.reg), CallArg::Reg(b.reg)], ExprType::Str)
            }
            BinaryOperator::Eq | BinaryOperator::Ne => {
                let eq = fb.emit_call_value(
                    ctx.rt.streq,
                    &[CallArg::Reg(a.reg), CallArg::Reg(b.reg)],
                    ExprType::Bool,
                )?;
                if op == BinaryOperator::Ne {
                    fb.emit(Inst::alu(AluOp::Xor, eq.reg, 1));
                }
                Ok(eq)
            }
            _ => Err(CompileError::type_error(
                format!("{} in {}", what, fb.name),
                "not defined for str",
            )),
        };
    }

    if let Some(cond) = comparison(op) {
        if a.ty == ExprType::Bool && !matches!(op, BinaryOperator::Eq | BinaryOperator::Ne) {
            return Err(CompileError::type_error(
                format!("{} in {}", what, fb.name),
                "ordering is not defined for bool",
            ));
        }
        fb.emit(Inst::alu(AluOp::Cmp, a.reg, b.reg));
        fb.emit(Inst::Setcc { cond, dst: a.reg });
        fb.emit(Inst::MovZx8 {
            dst: a.reg,
            src: Rm::Reg(a.reg),
        });
        fb.free(b.reg);
        return Ok(Value {
            reg: a.reg,
            ty: ExprType::Bool,
        });
    }

    let want = match op {
        BinaryOperator::Land | BinaryOperator::Lor => ExprType::Bool,
        BinaryOperator::And | BinaryOperator::Or | BinaryOperator::Xor => a.ty,
        _ => ExprType::Int,
    };
    expect(fb, a, want, &what)?;

    match op {
        BinaryOperator::Add => fb.emit(Inst::alu(AluOp::Add, a.reg, b.reg)),
        BinaryOperator::Sub => fb.emit(Inst::alu(AluOp::Sub, a.reg, b.reg)),
        BinaryOperator::Mul => fb.emit(Inst::Imul {
            dst: a.reg,
            src: Rm::Reg(b.reg),
        }),
        BinaryOperator::And | BinaryOperator::Land => fb.emit(Inst::alu(AluOp::And, a.reg, b.reg)),
        BinaryOperator::Or | BinaryOperator::Lor => fb.emit(Inst::alu(AluOp::Or, a.reg, b.reg)),
        BinaryOperator::Xor => fb.emit(Inst::alu(AluOp::Xor, a.reg, b.reg)),
        BinaryOperator::Shl | BinaryOperator::Shr => {
            fb.emit(Inst::mov(Reg64::RCX, b.reg));
            fb.emit(Inst::Shift {
                op: if op == BinaryOperator::Shl {
                    ShiftOp::Shl
                } else {
                    ShiftOp::Sar
                },
                dst: Rm::Reg(a.reg),
                amount: ShiftAmount::Cl,
            });
        }
        BinaryOperator::Div | BinaryOperator::Mod => emit_division(ctx, fb, op, a.reg, b.reg)?,
        _ => {
            return Err(CompileError::type_error(
                format!("{} in {}", what, fb.name),
                "operator has no integer lowering",
            ))
        }
    }
    fb.free(b.reg);
    Ok(a)
}

/// `a = a / b` or `a = a % b`.
///
/// A zero divisor panics. A divisor of -1 is lowered without `idiv`, which
/// would fault on `i64::MIN / -1`; the quotient wraps and the remainder is 0.
fn emit_division(
    ctx: &mut CodegenContext,
    fb: &mut FunctionBuilder,
    op: BinaryOperator,
    a: Reg64,
    b: Reg64,
) -> Result<()> {
    let message = ctx.intern_str("tidal: division by zero")?;
    let nonzero = ctx.labels.fresh("div.nonzero");
    let general = ctx.labels.fresh("div.general");
    let done = ctx.labels.fresh("div.done");

    fb.emit(Inst::test(b));
    fb.emit(Inst::jcc(Cond::NE, nonzero));
    fb.emit_call(ctx.rt.panic, &[CallArg::Addr(message, 0)])?;

    fb.emit(Inst::Label(nonzero));
    fb.emit(Inst::alu(AluOp::Cmp, b, -1));
    fb.emit(Inst::jcc(Cond::NE, general));
    if op == BinaryOperator::Div {
        fb.emit(Inst::Unary {
            op: UnaryOp::Neg,
            dst: Rm::Reg(a),
        });
    } else {
        fb.emit(Inst::zero(a));
    }
    fb.emit(Inst::Jmp(done));

    fb.emit(Inst::Label(general));
    fb.emit(Inst::mov(Reg64::RAX, a));
    fb.emit(Inst::Cqo);
    fb.emit(Inst::Unary {
        op: UnaryOp::Idiv,
        dst: Rm::Reg(b),
    });
    let result = if op == BinaryOperator::Div {
        Reg64::RAX
    } else {
        Reg64::RDX
    };
    fb.emit(Inst::mov(a, result));
    fb.emit(Inst::Label(done));
    Ok(())
}

fn emit_builtin(ctx: &mut CodegenContext, fb: &mut FunctionBuilder, name: Builtin, args: &[Expr]) -> Result<Value> {
    let (params, result, target) = match name {
        Builtin::Len => (&[ExprType::Str][..], ExprType::Int, ctx.rt.strlen),
        Builtin::Concat => (&[ExprType::Str, ExprType::Str][..], ExprType::Str, ctx.rt.concat),
        Builtin::Format => (&[ExprType::Int][..], ExprType::Str, ctx.rt.fmt_int),
        Builtin::Repeat => (&[ExprType::Str, ExprType::Int][..], ExprType::Str, ctx.rt.repeat),
        Builtin::ReadInput => {
            if args.is_empty() {
                return fb.emit_call_value(ctx.rt.read_str, &[CallArg::Imm(DEFAULT_READ_MAX)], ExprType::Str);
            }
            (&[ExprType::Int][..], ExprType::Str, ctx.rt.read_str)
        }
    };
    if args.len() != params.len() {
        return Err(CompileError::type_error(
            format!("`{}` in {}", name.name(), fb.name),
            format!("expected {} argument(s), found {}", params.len(), args.len()),
        ));
    }
    let regs = emit_args(ctx, fb, args, params, name.name())?;
    let call_args: Vec<CallArg> = regs.iter().map(|&r| CallArg::Reg(r)).collect();
    fb.emit_call_value(target, &call_args, result)
}

/// Evaluate and type-check call arguments, then release their registers
/// (in LIFO order) so the call sequence sees only the values live before it
fn emit_args(
    ctx: &mut CodegenContext,
    fb: &mut FunctionBuilder,
    args: &[Expr],
    params: &[ExprType],
    callee: &str,
) -> Result<Vec<Reg64>> {
    let mut regs = Vec::with_capacity(args.len());
    for (i, (arg, &want)) in args.iter().zip(params).enumerate() {
        let value = emit_expr(ctx, fb, arg)?;
        expect(fb, value, want, &format!("argument {} of `{}`", i + 1, callee))?;
        regs.push(value.reg);
    }
    for &reg in regs.iter().rev() {
        fb.free(reg);
    }
    Ok(regs)
}

/// Helpers receive the state and message pointers ahead of their parameters
fn emit_helper_call(ctx: &mut CodegenContext, fb: &mut FunctionBuilder, name: &str, args: &[Expr]) -> Result<Value> {
    let template = fb.template;
    let helper = template
        .helpers
        .iter()
        .find(|h| h.name == name)
        .ok_or_else(|| {
            CompileError::reference(
                format!("call to `{}` in {}", name, fb.name),
                format!("template `{}` has no such helper", template.name),
            )
        })?;
    if args.len() != helper.params.len() {
        return Err(CompileError::type_error(
            format!("call to `{}` in {}", name, fb.name),
            format!("expected {} argument(s), found {}", helper.params.len(), args.len()),
        ));
    }
    let label = ctx
        .helper_label(&fb.agent.name, name)
        .ok_or_else(|| CompileError::reference(format!("helper `{}`", name), "no routine label"))?;
    let params: Vec<ExprType> = helper.params.iter().map(|p| p.ty.expr_type()).collect();
    let result = helper.returns.map(|t| t.expr_type()).unwrap_or(ExprType::Int);

    let regs = emit_args(ctx, fb, args, &params, name)?;
    let mut call_args = vec![CallArg::Reg(STATE_BASE_REG), CallArg::Reg(MESSAGE_REG)];
    call_args.extend(regs.iter().map(|&r| CallArg::Reg(r)));
    fb.emit_call_value(label, &call_args, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::tests::program;
    use crate::codegen::{FunctionBuilder, ReturnKind};
    use crate::layout::analyze;
    use crate::model::ProgramModel;

    const COUNTER: &str = r#"{
        "schemas": [{"name": "Tick", "fields": [{"name": "n", "type": "i32"},
                                                {"name": "ok", "type": "bool"}]}],
        "templates": [{
            "name": "Counter",
            "state": [{"name": "total", "type": "i64"}, {"name": "label", "type": "str"}],
            "handlers": [{"schema": "Tick"}],
            "helpers": [{"name": "twice", "params": [{"name": "x", "type": "i64"}],
                         "returns": "i64",
                         "body": [{"kind": "return", "value": {"kind": "binary", "op": "add",
                                   "lhs": {"kind": "local", "name": "x"},
                                   "rhs": {"kind": "local", "name": "x"}}}]}]
        }],
        "instances": [{"name": "c", "template": "Counter"}],
        "routes": [{"from": "external", "schema": "Tick", "to": ["c"]}],
        "seed": {"schema": "Tick"}
    }"#;

    /// Lower one expression inside the `c.Tick` handler
    fn lower(json_expr: &str) -> Result<(Vec<Inst>, Value)> {
        let (model, config): (ProgramModel, _) = program(COUNTER);
        let layout = analyze(&model, &config).unwrap();
        let mut ctx = CodegenContext::new(&model, &layout, &config).unwrap();
        let expr: Expr = serde_json::from_str(json_expr).unwrap();
        let agent = layout.agent("c").unwrap();
        let epilogue = ctx.labels.fresh("epilogue");
        let mut fb = FunctionBuilder::new(
            "handler.c.Tick",
            agent,
            &model.templates[0],
            layout.schema("Tick"),
            ReturnKind::Status,
            epilogue,
        );
        let value = emit_expr(&mut ctx, &mut fb, &expr)?;
        Ok((fb.insts, value))
    }

    #[test]
    fn test_small_literal_is_an_immediate() {
        let (insts, value) = lower(r#"{"kind": "int", "value": -7}"#).unwrap();
        assert_eq!(insts, vec![Inst::mov(Reg64::RBX, -7i64)]);
        assert_eq!(value.ty, ExprType::Int);
    }

    #[test]
    fn test_wide_literal_is_pooled() {
        let (insts, _) = lower(r#"{"kind": "int", "value": 5000000000}"#).unwrap();
        assert!(matches!(
            insts[0],
            Inst::Mov {
                src: crate::x64::inst::Operand::Mem(Mem {
                    base: crate::x64::inst::Base::Rip(_),
                    ..
                }),
                ..
            }
        ));
    }

    #[test]
    fn test_field_loads_use_declared_width() {
        let (insts, value) = lower(r#"{"kind": "field", "field": "n"}"#).unwrap();
        assert_eq!(
            insts,
            vec![Inst::MovSx32 {
                dst: Reg64::RBX,
                src: Rm::Mem(Mem::disp(Reg64::R13, 0))
            }]
        );
        assert_eq!(value.ty, ExprType::Int);

        let (insts, value) = lower(r#"{"kind": "field", "field": "ok"}"#).unwrap();
        assert_eq!(
            insts,
            vec![Inst::MovZx8 {
                dst: Reg64::RBX,
                src: Rm::Mem(Mem::disp(Reg64::R13, 4))
            }]
        );
        assert_eq!(value.ty, ExprType::Bool);
    }

    #[test]
    fn test_comparison_idiom() {
        let (insts, value) = lower(
            r#"{"kind": "binary", "op": "lt",
                "lhs": {"kind": "state", "field": "total"},
                "rhs": {"kind": "int", "value": 10}}"#,
        )
        .unwrap();
        assert_eq!(value.ty, ExprType::Bool);
        assert_eq!(
            &insts[2..],
            &[
                Inst::alu(AluOp::Cmp, Reg64::RBX, Reg64::R14),
                Inst::Setcc {
                    cond: Cond::L,
                    dst: Reg64::RBX
                },
                Inst::MovZx8 {
                    dst: Reg64::RBX,
                    src: Rm::Reg(Reg64::RBX)
                },
            ]
        );
    }

    #[test]
    fn test_division_checks_zero_and_minus_one() {
        let (insts, _) = lower(
            r#"{"kind": "binary", "op": "mod",
                "lhs": {"kind": "state", "field": "total"},
                "rhs": {"kind": "field", "field": "n"}}"#,
        )
        .unwrap();
        assert!(insts.contains(&Inst::test(Reg64::R14)));
        assert!(insts.contains(&Inst::alu(AluOp::Cmp, Reg64::R14, -1i64)));
        assert!(insts.contains(&Inst::Cqo));
        assert!(insts.contains(&Inst::mov(Reg64::RBX, Reg64::RDX)));
    }

    #[test]
    fn test_string_concat_calls_runtime() {
        let (insts, value) = lower(
            r#"{"kind": "binary", "op": "add",
                "lhs": {"kind": "state", "field": "label"},
                "rhs": {"kind": "str", "value": "!"}}"#,
        )
        .unwrap();
        assert_eq!(value.ty, ExprType::Str);
        assert!(insts.contains(&Inst::mov(Reg64::RDI, Reg64::RBX)));
        assert!(insts.contains(&Inst::mov(Reg64::RSI, Reg64::R14)));
        assert_eq!(insts.last(), Some(&Inst::mov(Reg64::RBX, Reg64::RAX)));
    }

    #[test]
    fn test_helper_call_passes_context_registers() {
        let (insts, value) = lower(
            r#"{"kind": "call", "helper": "twice", "args": [{"kind": "int", "value": 4}]}"#,
        )
        .unwrap();
        assert_eq!(value.ty, ExprType::Int);
        assert!(insts.contains(&Inst::mov(Reg64::RDI, Reg64::R12)));
        assert!(insts.contains(&Inst::mov(Reg64::RSI, Reg64::R13)));
        assert!(insts.contains(&Inst::mov(Reg64::RDX, Reg64::RBX)));
    }

    #[test]
    fn test_type_mismatch() {
        let err = lower(
            r#"{"kind": "binary", "op": "add",
                "lhs": {"kind": "int", "value": 1},
                "rhs": {"kind": "bool", "value": true}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::Type { .. }));
    }

    #[test]
    fn test_unknown_names_are_reference_errors() {
        for expr in [
            r#"{"kind": "state", "field": "missing"}"#,
            r#"{"kind": "field", "field": "missing"}"#,
            r#"{"kind": "local", "name": "missing"}"#,
            r#"{"kind": "call", "helper": "missing"}"#,
        ] {
            assert!(
                matches!(lower(expr), Err(CompileError::Reference { .. })),
                "{}",
                expr
            );
        }
    }

    #[test]
    fn test_deep_expression_exhausts_scratch_pool() {
        // right-leaning chain keeps every left operand live
        let mut expr = r#"{"kind": "int", "value": 1}"#.to_string();
        for _ in 0..6 {
            expr = format!(
                r#"{{"kind": "binary", "op": "add", "lhs": {{"kind": "int", "value": 1}}, "rhs": {}}}"#,
                expr
            );
        }
        assert!(matches!(
            lower(&expr),
            Err(ref e @ CompileError::ResourceExhaustion { .. }) if e.stage() == "codegen"
        ));
    }
}
