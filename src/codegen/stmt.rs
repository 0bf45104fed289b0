//! Statement Emitter

use std::collections::BTreeMap;

use crate::error::{CompileError, Result};
use crate::model::{AssignTarget, Endpoint, Expr, ExprType, Stmt};
use crate::x64::inst::{Cond, Inst, Label, Mem};
use crate::x64::registers::{Reg64, STATE_BASE_REG, SYSV_RET_REG};

use super::expr::{emit_expr, expect};
use super::runtime::syscall;
use super::{CallArg, CodegenContext, FunctionBuilder, ReturnKind, Value};

/// Emit a statement list in its own local scope
pub fn emit_block(ctx: &mut CodegenContext, fb: &mut FunctionBuilder, body: &[Stmt]) -> Result<()> {
    fb.push_scope();
    for stmt in body {
        emit_stmt(ctx, fb, stmt)?;
    }
    fb.pop_scope();
    Ok(())
}

pub fn emit_stmt(ctx: &mut CodegenContext, fb: &mut FunctionBuilder, stmt: &Stmt) -> Result<()> {
    match stmt {
        Stmt::Let { name, value } => {
            // Evaluated before the name exists, so `let x = x` reads the outer `x`
            let v = emit_expr(ctx, fb, value)?;
            let local = fb.declare_local(name, v.ty)?;
            fb.emit(Inst::mov(FunctionBuilder::local_mem(local.slot), v.reg));
            fb.free(v.reg);
        }
        Stmt::Assign { target, value } => emit_assign(ctx, fb, target, value)?,
        Stmt::Emit { schema, fields } => emit_message(ctx, fb, schema, fields)?,
        Stmt::If {
            cond,
            then,
            otherwise,
        } => {
            let else_label = ctx.labels.fresh("if.else");
            let join = ctx.labels.fresh("if.join");
            emit_condition(ctx, fb, cond, else_label, "if condition")?;
            emit_block(ctx, fb, then)?;
            fb.emit(Inst::Jmp(join));
            fb.emit(Inst::Label(else_label));
            emit_block(ctx, fb, otherwise)?;
            fb.emit(Inst::Label(join));
        }
        Stmt::While { cond, body } => {
            let head = ctx.labels.fresh("while.head");
            let exit = ctx.labels.fresh("while.exit");
            fb.emit(Inst::Label(head));
            emit_condition(ctx, fb, cond, exit, "while condition")?;
            emit_block(ctx, fb, body)?;
            fb.emit(Inst::Jmp(head));
            fb.emit(Inst::Label(exit));
        }
        Stmt::Block { body } => emit_block(ctx, fb, body)?,
        Stmt::Write { value } => {
            let v = emit_expr(ctx, fb, value)?;
            fb.free(v.reg);
            emit_print(ctx, fb, syscall::STDOUT, v)?;
        }
        Stmt::Report { value } => {
            if !ctx.config.debug_reports {
                return Ok(());
            }
            let newline = ctx.intern_str("\n")?;
            let v = emit_expr(ctx, fb, value)?;
            fb.free(v.reg);
            emit_print(ctx, fb, syscall::STDERR, v)?;
            fb.emit_call(
                ctx.rt.puts,
                &[CallArg::Imm(syscall::STDERR), CallArg::Addr(newline, 0)],
            )?;
        }
        Stmt::Return { value } => emit_return(ctx, fb, value.as_ref())?,
    }
    Ok(())
}

/// Evaluate a bool and jump to `otherwise` when it is false
fn emit_condition(
    ctx: &mut CodegenContext,
    fb: &mut FunctionBuilder,
    cond: &Expr,
    otherwise: Label,
    what: &str,
) -> Result<()> {
    let v = emit_expr(ctx, fb, cond)?;
    expect(fb, v, ExprType::Bool, what)?;
    fb.emit(Inst::test(v.reg));
    fb.free(v.reg);
    fb.emit(Inst::jcc(Cond::E, otherwise));
    Ok(())
}

/// Print an already released value; its register must not be reused first
fn emit_print(ctx: &mut CodegenContext, fb: &mut FunctionBuilder, fd: i64, v: Value) -> Result<()> {
    let routine = match v.ty {
        ExprType::Str => ctx.rt.puts,
        ExprType::Int => ctx.rt.print_int,
        ExprType::Bool => ctx.rt.print_bool,
    };
    fb.emit_call(routine, &[CallArg::Imm(fd), CallArg::Reg(v.reg)])
}

fn emit_assign(ctx: &mut CodegenContext, fb: &mut FunctionBuilder, target: &AssignTarget, value: &Expr) -> Result<()> {
    let v = emit_expr(ctx, fb, value)?;
    match target {
        AssignTarget::State { field } => {
            let slot = fb.agent.state.field(field).ok_or_else(|| {
                CompileError::reference(
                    format!("state field `{}` in {}", field, fb.name),
                    format!("`{}` has no such field", fb.agent.name),
                )
            })?;
            let (offset, ty) = (slot.offset as i32, slot.ty);
            expect(fb, v, ty.expr_type(), &format!("assignment to `{}`", field))?;
            fb.store(Mem::disp(STATE_BASE_REG, offset), v.reg, ty);
        }
        AssignTarget::Local { name } => {
            let local = fb.lookup_local(name).ok_or_else(|| {
                CompileError::reference(format!("local `{}` in {}", name, fb.name), "not declared")
            })?;
            expect(fb, v, local.ty, &format!("assignment to `{}`", name))?;
            fb.emit(Inst::mov(FunctionBuilder::local_mem(local.slot), v.reg));
        }
    }
    fb.free(v.reg);
    Ok(())
}

/// Build the payload on the heap, then enqueue it for every destination of
/// the edge (current agent, schema)
fn emit_message(
    ctx: &mut CodegenContext,
    fb: &mut FunctionBuilder,
    schema_name: &str,
    fields: &BTreeMap<String, Expr>,
) -> Result<()> {
    let layout = ctx.layout;
    let entity = format!("emit `{}` in {}", schema_name, fb.name);
    let schema = layout
        .schema(schema_name)
        .ok_or_else(|| CompileError::reference(entity.clone(), "unknown schema"))?;
    for name in fields.keys() {
        if schema.record.field(name).is_none() {
            return Err(CompileError::reference(
                entity,
                format!("`{}` is not a field of `{}`", name, schema.name),
            ));
        }
    }
    for slot in &schema.record.fields {
        if !fields.contains_key(&slot.name) {
            return Err(CompileError::reference(
                entity,
                format!("field `{}` is not set", slot.name),
            ));
        }
    }

    let source = Endpoint::Agent(fb.agent.name.clone());
    let destinations = layout.destinations(&source, &schema.name);
    if destinations.is_empty() {
        return Ok(());
    }

    let payload = fb.emit_call_value(
        ctx.rt.alloc,
        &[CallArg::Imm(schema.record.size as i64)],
        ExprType::Str,
    )?;
    for slot in &schema.record.fields {
        let Some(expr) = fields.get(&slot.name) else {
            continue;
        };
        let v = emit_expr(ctx, fb, expr)?;
        expect(fb, v, slot.ty.expr_type(), &format!("field `{}` of `{}`", slot.name, schema.name))?;
        fb.store(Mem::disp(payload.reg, slot.offset as i32), v.reg, slot.ty);
        fb.free(v.reg);
    }
    for dest in destinations {
        let storage = ctx.storage(dest).ok_or_else(|| {
            CompileError::reference(format!("agent `{}`", dest), "destination has no queue")
        })?;
        fb.emit_call(
            ctx.rt.enqueue,
            &[
                CallArg::Addr(storage.queue, 0),
                CallArg::Imm(schema.id as i64),
                CallArg::Reg(payload.reg),
            ],
        )?;
    }
    fb.free(payload.reg);
    Ok(())
}

fn emit_return(ctx: &mut CodegenContext, fb: &mut FunctionBuilder, value: Option<&Expr>) -> Result<()> {
    let entity = format!("return in {}", fb.name);
    let want = match fb.returns {
        ReturnKind::Status => Some(ExprType::Int),
        ReturnKind::Value(ty) => ty.map(|t| t.expr_type()),
    };
    match (value, want) {
        (Some(expr), Some(want)) => {
            let v = emit_expr(ctx, fb, expr)?;
            expect(fb, v, want, "return value")?;
            fb.emit(Inst::mov(SYSV_RET_REG, v.reg));
            fb.free(v.reg);
        }
        (None, Some(_)) if fb.returns != ReturnKind::Status => {
            return Err(CompileError::type_error(entity, "missing return value"));
        }
        (Some(_), None) => {
            return Err(CompileError::type_error(entity, "helper declares no return type"));
        }
        (None, _) => fb.emit(Inst::zero(Reg64::RAX)),
    }
    fb.emit(Inst::Jmp(fb.epilogue));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::tests::program;
    use crate::config::CompileConfig;
    use crate::layout::analyze;
    use crate::model::{ProgramModel, ValueType};
    use crate::x64::inst::{AluOp, Width};

    const RELAY: &str = r#"{
        "schemas": [
            {"name": "Start", "fields": []},
            {"name": "Note", "fields": [{"name": "text", "type": "str"},
                                        {"name": "n", "type": "i32"}]}
        ],
        "templates": [
            {"name": "Relay",
             "state": [{"name": "hits", "type": "i32"}, {"name": "live", "type": "bool"}],
             "handlers": [{"schema": "Start"}]},
            {"name": "Sink", "handlers": [{"schema": "Note"}]}
        ],
        "instances": [{"name": "relay", "template": "Relay"},
                      {"name": "left", "template": "Sink"},
                      {"name": "right", "template": "Sink"}],
        "routes": [
            {"from": "external", "schema": "Start", "to": ["relay"]},
            {"from": {"agent": "relay"}, "schema": "Note", "to": ["left", "right"]}
        ],
        "seed": {"schema": "Start"}
    }"#;

    fn lower_in(agent: &str, schema: &str, config: CompileConfig, body: &str) -> Result<Vec<Inst>> {
        let (model, _): (ProgramModel, _) = program(RELAY);
        let layout = analyze(&model, &config).unwrap();
        let mut ctx = CodegenContext::new(&model, &layout, &config).unwrap();
        let body: Vec<Stmt> = serde_json::from_str(body).unwrap();
        let agent = layout.agent(agent).unwrap();
        let template = model.template(&agent.template).unwrap();
        let epilogue = ctx.labels.fresh("epilogue");
        let mut fb = FunctionBuilder::new(
            format!("handler.{}.{}", agent.name, schema),
            agent,
            template,
            layout.schema(schema),
            ReturnKind::Status,
            epilogue,
        );
        emit_block(&mut ctx, &mut fb, &body)?;
        assert!(fb.live().is_empty(), "scratch registers leaked");
        Ok(fb.insts)
    }

    fn lower(body: &str) -> Result<Vec<Inst>> {
        lower_in("relay", "Start", CompileConfig::default(), body)
    }

    #[test]
    fn test_assign_stores_with_field_width() {
        let insts = lower(
            r#"[{"kind": "assign", "target": {"kind": "state", "field": "hits"},
                 "value": {"kind": "int", "value": 3}},
                {"kind": "assign", "target": {"kind": "state", "field": "live"},
                 "value": {"kind": "bool", "value": true}}]"#,
        )
        .unwrap();
        assert!(insts.contains(&Inst::mov_w(Width::W32, Mem::disp(Reg64::R12, 0), Reg64::RBX)));
        assert!(insts.contains(&Inst::mov_w(Width::W8, Mem::disp(Reg64::R12, 4), Reg64::RBX)));
    }

    #[test]
    fn test_emit_enqueues_for_each_destination_in_order() {
        let insts = lower(
            r#"[{"kind": "emit", "schema": "Note",
                 "fields": {"text": {"kind": "str", "value": "hi"}, "n": {"kind": "int", "value": 2}}}]"#,
        )
        .unwrap();
        let calls: Vec<&Inst> = insts.iter().filter(|i| matches!(i, Inst::Call(_))).collect();
        // alloc, enqueue(left), enqueue(right)
        assert_eq!(calls.len(), 3);
        let ids: Vec<&Inst> = insts
            .iter()
            .filter(|i| **i == Inst::mov(Reg64::RSI, 2i64))
            .collect();
        assert_eq!(ids.len(), 2);
        // size of Note: str (8) + i32 (4), rounded to 16
        assert!(insts.contains(&Inst::mov(Reg64::RDI, 16i64)));
    }

    #[test]
    fn test_emit_without_destinations_is_empty() {
        let insts = lower_in(
            "left",
            "Note",
            CompileConfig::default(),
            r#"[{"kind": "emit", "schema": "Note",
                 "fields": {"text": {"kind": "str", "value": "x"}, "n": {"kind": "int", "value": 1}}}]"#,
        )
        .unwrap();
        assert!(insts.is_empty());
    }

    #[test]
    fn test_emit_requires_every_field() {
        let err = lower(
            r#"[{"kind": "emit", "schema": "Note", "fields": {"n": {"kind": "int", "value": 2}}}]"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("`text` is not set"));

        let err = lower(
            r#"[{"kind": "emit", "schema": "Note", "fields": {"bogus": {"kind": "int", "value": 2}}}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::Reference { .. }));
    }

    #[test]
    fn test_if_lowers_to_test_and_je() {
        let insts = lower(
            r#"[{"kind": "if", "cond": {"kind": "state", "field": "live"},
                 "then": [{"kind": "return", "value": {"kind": "int", "value": 1}}]}]"#,
        )
        .unwrap();
        assert!(matches!(insts[1], Inst::Test { .. }));
        assert!(matches!(insts[2], Inst::Jcc { cond: Cond::E, .. }));
        assert!(insts.contains(&Inst::mov(Reg64::RAX, Reg64::RBX)));
    }

    #[test]
    fn test_condition_must_be_bool() {
        let err = lower(r#"[{"kind": "while", "cond": {"kind": "int", "value": 1}}]"#).unwrap_err();
        assert!(matches!(err, CompileError::Type { .. }));
    }

    #[test]
    fn test_locals_are_scoped() {
        let ok = lower(
            r#"[{"kind": "let", "name": "x", "value": {"kind": "int", "value": 1}},
                {"kind": "block", "body": [
                    {"kind": "let", "name": "x", "value": {"kind": "local", "name": "x"}}]},
                {"kind": "assign", "target": {"kind": "local", "name": "x"},
                 "value": {"kind": "int", "value": 2}}]"#,
        );
        assert!(ok.is_ok());

        let err = lower(
            r#"[{"kind": "block", "body": [
                    {"kind": "let", "name": "y", "value": {"kind": "int", "value": 1}}]},
                {"kind": "write", "value": {"kind": "local", "name": "y"}}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::Reference { .. }));
    }

    #[test]
    fn test_report_is_a_no_op_by_default() {
        let body = r#"[{"kind": "report", "value": {"kind": "str", "value": "dbg"}}]"#;
        assert!(lower(body).unwrap().is_empty());

        let config = CompileConfig {
            debug_reports: true,
            ..Default::default()
        };
        let insts = lower_in("relay", "Start", config, body).unwrap();
        assert!(insts.contains(&Inst::mov(Reg64::RDI, syscall::STDERR)));
        assert_eq!(insts.iter().filter(|i| matches!(i, Inst::Call(_))).count(), 2);
    }

    #[test]
    fn test_write_picks_print_routine_by_type() {
        let insts = lower(r#"[{"kind": "write", "value": {"kind": "state", "field": "live"}}]"#).unwrap();
        assert!(insts.contains(&Inst::mov(Reg64::RDI, syscall::STDOUT)));
        assert!(insts.contains(&Inst::mov(Reg64::RSI, Reg64::RBX)));
        assert!(!insts.iter().any(|i| matches!(i, Inst::Alu { op: AluOp::Sub, .. })));
    }

    #[test]
    fn test_bare_return_in_handler_is_status_zero() {
        let insts = lower(r#"[{"kind": "return"}]"#).unwrap();
        assert_eq!(insts[0], Inst::zero(Reg64::RAX));
        assert!(matches!(insts[1], Inst::Jmp(_)));
        assert_eq!(ValueType::I32.expr_type(), ExprType::Int);
    }
}
