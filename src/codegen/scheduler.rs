//! Scheduler Emitter
//!
//! Generates `_start`: inject the seed message, then run tidal cycles until
//! every queue is empty or the cycle bound is reached.
//!
//! ```text
//! _start:  align stack, cycle counter (rbx) = 0, build and route the seed
//! rest:    cycle bound reached or all queues empty -> halt
//! sense:   rt_dequeue(queue, slot) for every agent
//! act:     for every active slot, call the handler matching its schema id;
//!          a non-zero status ends the program with that status
//!          rbx += 1, jump to rest
//! ```
//!
//! Agents are visited in declaration order in every phase, so a program's
//! output depends only on its model.

use tracing::debug;

use crate::error::{CompileError, Result};
use crate::model::{Endpoint, Literal, ValueType};
use crate::x64::inst::{AluOp, Cond, Inst, Label, Mem, Width};
use crate::x64::registers::Reg64::{self, *};

use super::CodegenContext;

/// Emit `_start` and return its label
pub fn emit_scheduler(ctx: &mut CodegenContext) -> Result<Label> {
    let entry = ctx.labels.named("_start")?;
    let rest = ctx.labels.fresh("rest");
    let sense = ctx.labels.fresh("sense");
    let fail = ctx.labels.fresh("fail");
    let halt = ctx.labels.fresh("halt");

    let mut out = vec![Inst::Align(16), Inst::Label(entry)];
    out.push(Inst::alu(AluOp::And, RSP, -16));
    // rbx counts completed cycles
    out.push(Inst::zero(RBX));

    emit_seed(ctx, &mut out)?;

    let layout = ctx.layout;
    let queued: Vec<_> = layout
        .agents()
        .iter()
        .filter_map(|a| ctx.storage(&a.name).map(|s| (a, s)))
        .collect();

    // REST
    out.push(Inst::Label(rest));
    if ctx.config.max_cycles > 0 {
        let bound = i64::try_from(ctx.config.max_cycles)
            .map_err(|_| CompileError::codegen_exhausted("cycle bound", ctx.config.max_cycles, i64::MAX as u64))?;
        out.push(Inst::mov(RAX, bound));
        out.push(Inst::alu(AluOp::Cmp, RBX, RAX));
        out.push(Inst::jcc(Cond::AE, halt));
    }
    for (_, storage) in &queued {
        out.push(Inst::alu(AluOp::Cmp, Mem::sym(storage.queue, 8), 0));
        out.push(Inst::jcc(Cond::NE, sense));
    }
    out.push(Inst::Jmp(halt));

    // SENSE
    out.push(Inst::Label(sense));
    for (_, storage) in &queued {
        out.push(Inst::lea(RDI, Mem::sym(storage.queue, 0)));
        out.push(Inst::lea(RSI, Mem::sym(storage.slot, 0)));
        out.push(Inst::Call(ctx.rt.dequeue));
    }

    // ACT
    for (agent, storage) in &queued {
        let next = ctx.labels.fresh("act.next");
        let base = i32::try_from(agent.base)
            .map_err(|_| CompileError::codegen_exhausted("agent state arena", agent.base, i32::MAX as u64))?;
        out.push(Inst::alu(AluOp::Cmp, Mem::sym(storage.slot, 0), 0));
        out.push(Inst::jcc(Cond::E, next));
        out.push(Inst::mov(Mem::sym(storage.slot, 0), 0i64));
        out.push(Inst::mov(RAX, Mem::sym(storage.slot, 8)));
        for (schema, _) in layout.agent_handlers(&agent.name) {
            let Some(handler) = ctx.handler_label(&agent.name, &schema.name) else {
                continue;
            };
            let other = ctx.labels.fresh("act.other");
            out.push(Inst::alu(AluOp::Cmp, RAX, schema.id as i64));
            out.push(Inst::jcc(Cond::NE, other));
            out.push(Inst::lea(RDI, Mem::sym(ctx.state, base)));
            out.push(Inst::mov(RSI, Mem::sym(storage.slot, 16)));
            out.push(Inst::Call(handler));
            out.push(Inst::test(RAX));
            out.push(Inst::jcc(Cond::NE, fail));
            out.push(Inst::Jmp(next));
            out.push(Inst::Label(other));
        }
        out.push(Inst::Label(next));
    }
    out.push(Inst::alu(AluOp::Add, RBX, 1));
    out.push(Inst::Jmp(rest));

    out.push(Inst::Label(fail));
    out.push(Inst::mov(RDI, RAX));
    out.push(Inst::Call(ctx.rt.exit));

    out.push(Inst::Label(halt));
    out.push(Inst::zero(RDI));
    out.push(Inst::Call(ctx.rt.exit));

    debug!(
        queues = queued.len(),
        instructions = out.len(),
        max_cycles = ctx.config.max_cycles,
        "scheduler emitted"
    );
    ctx.text.extend(out);
    Ok(entry)
}

/// Build the seed payload in r14 and enqueue it along the external edges.
/// Unset fields stay zero; unset strings point at "".
fn emit_seed(ctx: &mut CodegenContext, out: &mut Vec<Inst>) -> Result<()> {
    let (layout, model) = (ctx.layout, ctx.model);
    let seed = &model.seed;
    let schema = layout
        .schema(&seed.schema)
        .ok_or_else(|| CompileError::reference("seed message", format!("unknown schema `{}`", seed.schema)))?;

    out.push(Inst::mov(RDI, schema.record.size as i64));
    out.push(Inst::Call(ctx.rt.alloc));
    out.push(Inst::mov(R14, RAX));

    for slot in &schema.record.fields {
        let at = Mem::disp(R14, slot.offset as i32);
        match (seed.fields.get(&slot.name), slot.ty) {
            (Some(Literal::Str(text)), _) => {
                let sym = ctx.intern_str(text)?;
                out.push(Inst::lea(RAX, Mem::sym(sym, 0)));
                out.push(Inst::mov(at, RAX));
            }
            (None, ValueType::Str) => {
                let sym = ctx.intern_str("")?;
                out.push(Inst::lea(RAX, Mem::sym(sym, 0)));
                out.push(Inst::mov(at, RAX));
            }
            (Some(Literal::Int(v)), ty) => store_scalar(out, at, *v, ty),
            (Some(Literal::Bool(b)), ty) => store_scalar(out, at, *b as i64, ty),
            (None, _) => {}
        }
    }

    for dest in layout.destinations(&Endpoint::External, &schema.name) {
        let storage = ctx.storage(dest).ok_or_else(|| {
            CompileError::reference(format!("agent `{}`", dest), "destination has no queue")
        })?;
        out.push(Inst::lea(RDI, Mem::sym(storage.queue, 0)));
        out.push(Inst::mov(RSI, schema.id as i64));
        out.push(Inst::mov(RDX, R14));
        out.push(Inst::Call(ctx.rt.enqueue));
    }
    Ok(())
}

fn store_scalar(out: &mut Vec<Inst>, at: Mem, value: i64, ty: ValueType) {
    let width = match ty {
        ValueType::Bool => Width::W8,
        ValueType::I32 => Width::W32,
        ValueType::I64 | ValueType::Str => Width::W64,
    };
    out.push(Inst::mov(RAX, value));
    out.push(Inst::mov_w(width, at, Reg64::RAX));
}
