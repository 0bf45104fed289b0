//! Handler and Helper Emitter
//!
//! The body is generated first into the routine's own buffer; once the frame
//! size and the set of clobbered callee-saved registers are known, the
//! prologue and epilogue are wrapped around it.
//!
//! ```text
//! push rbp
//! mov rbp, rsp
//! sub rsp, F            ; locals at [rbp - 8], [rbp - 16], ...
//! push r12, r13, ...    ; callee-saved registers the body uses
//! mov r12, rdi          ; agent state
//! mov r13, rsi          ; message payload
//! <spill helper parameters>
//! <body>
//! xor rax, rax
//! epilogue:
//! pop ...
//! mov rsp, rbp
//! pop rbp
//! ret
//! ```

use tracing::debug;

use crate::error::{CompileError, Result};
use crate::layout::AgentLayout;
use crate::model::{AgentTemplate, Handler, Helper};
use crate::x64::inst::{AluOp, Inst, Label};
use crate::x64::registers::{Reg64, MESSAGE_REG, STATE_BASE_REG, SYSV_ARG_REGS};

use super::stmt::emit_block;
use super::{CodegenContext, FunctionBuilder, ReturnKind};

/// Compile the handler of `agent` for one inbound schema
pub fn emit_handler(
    ctx: &mut CodegenContext,
    agent: &AgentLayout,
    template: &AgentTemplate,
    handler: &Handler,
) -> Result<()> {
    let layout = ctx.layout;
    let schema = layout.schema(&handler.schema).ok_or_else(|| {
        CompileError::reference(
            format!("handler {}.{}", agent.name, handler.schema),
            "unknown schema",
        )
    })?;
    let entry = ctx.handler_label(&agent.name, &handler.schema).ok_or_else(|| {
        CompileError::reference(
            format!("handler {}.{}", agent.name, handler.schema),
            "no handler unit for this pair",
        )
    })?;
    let epilogue = ctx.labels.fresh("epilogue");
    let mut fb = FunctionBuilder::new(
        ctx.labels.name(entry),
        agent,
        template,
        Some(schema),
        ReturnKind::Status,
        epilogue,
    );
    emit_block(ctx, &mut fb, &handler.body)?;
    finish(ctx, fb, entry, 0);
    Ok(())
}

/// Compile one helper of `agent`; parameters become the first frame slots
pub fn emit_helper(ctx: &mut CodegenContext, agent: &AgentLayout, template: &AgentTemplate, helper: &Helper) -> Result<()> {
    let entry = ctx.helper_label(&agent.name, &helper.name).ok_or_else(|| {
        CompileError::reference(format!("helper {}.{}", agent.name, helper.name), "no routine label")
    })?;
    // Two slots of the argument registers carry the state and message pointers
    let param_regs = &SYSV_ARG_REGS[2..];
    if helper.params.len() > param_regs.len() {
        return Err(CompileError::codegen_exhausted(
            format!("parameters of helper {}.{}", agent.name, helper.name),
            helper.params.len() as u64,
            param_regs.len() as u64,
        ));
    }

    let epilogue = ctx.labels.fresh("epilogue");
    let mut fb = FunctionBuilder::new(
        ctx.labels.name(entry),
        agent,
        template,
        None,
        ReturnKind::Value(helper.returns),
        epilogue,
    );
    for param in &helper.params {
        fb.declare_local(&param.name, param.ty.expr_type())?;
    }
    emit_block(ctx, &mut fb, &helper.body)?;
    finish(ctx, fb, entry, helper.params.len());
    Ok(())
}

/// Wrap the body in prologue and epilogue and append it to the text stream
fn finish(ctx: &mut CodegenContext, fb: FunctionBuilder, entry: Label, params: usize) {
    let mut saved = vec![STATE_BASE_REG, MESSAGE_REG];
    saved.extend(fb.clobbered_callee_saved());
    let slots = fb.slot_count() as i64;
    // rsp is aligned after `push rbp`; locals and saved registers together
    // must add up to a multiple of 16
    let mut frame = 8 * slots;
    if (slots + saved.len() as i64) % 2 == 1 {
        frame += 8;
    }

    let out = &mut ctx.text;
    let start = out.len();
    out.push(Inst::Align(16));
    out.push(Inst::Label(entry));
    out.push(Inst::Push(Reg64::RBP));
    out.push(Inst::mov(Reg64::RBP, Reg64::RSP));
    if frame > 0 {
        out.push(Inst::alu(AluOp::Sub, Reg64::RSP, frame));
    }
    for &reg in &saved {
        out.push(Inst::Push(reg));
    }
    out.push(Inst::mov(STATE_BASE_REG, Reg64::RDI));
    out.push(Inst::mov(MESSAGE_REG, Reg64::RSI));
    for (slot, &reg) in SYSV_ARG_REGS[2..].iter().take(params).enumerate() {
        out.push(Inst::mov(FunctionBuilder::local_mem(slot as u32), reg));
    }

    out.extend(fb.insts);

    // Falling off the end returns 0
    out.push(Inst::zero(Reg64::RAX));
    out.push(Inst::Label(fb.epilogue));
    for &reg in saved.iter().rev() {
        out.push(Inst::Pop(reg));
    }
    out.push(Inst::mov(Reg64::RSP, Reg64::RBP));
    out.push(Inst::Pop(Reg64::RBP));
    out.push(Inst::Ret);

    debug!(
        routine = %fb.name,
        frame,
        saved = saved.len(),
        instructions = ctx.text.len() - start,
        "routine emitted"
    );
}
