//! Runtime Library
//!
//! Hand-written routines emitted once per image, after all generated code.
//! Every routine follows System V: arguments in `rdi, rsi, rdx`, result in
//! `rax`, and only caller-saved registers are clobbered unless pushed first.
//! Internal calls keep `rsp` 16-byte aligned.
//!
//! | Routine          | Arguments                 | Result             |
//! |------------------|---------------------------|--------------------|
//! | `rt_alloc`       | size                      | zeroed block       |
//! | `rt_memcpy`      | dst, src, len             | dst                |
//! | `rt_memset`      | dst, byte, len            | dst                |
//! | `rt_strlen`      | s                         | length             |
//! | `rt_streq`       | a, b                      | 1 if equal, else 0 |
//! | `rt_concat`      | a, b                      | new string         |
//! | `rt_fmt_int`     | n                         | decimal string     |
//! | `rt_repeat`      | s, n                      | new string         |
//! | `rt_read`        | fd, buf, len              | bytes read         |
//! | `rt_read_str`    | max                       | new string         |
//! | `rt_write`       | fd, buf, len              |                    |
//! | `rt_puts`        | fd, s                     |                    |
//! | `rt_print_int`   | fd, n                     |                    |
//! | `rt_print_bool`  | fd, b                     |                    |
//! | `rt_enqueue`     | queue, schema id, payload |                    |
//! | `rt_dequeue`     | queue, slot               |                    |
//! | `rt_panic`       | message                   | does not return    |
//! | `rt_exit`        | status                    | does not return    |

use tracing::debug;

use super::{CodegenContext, QUEUE_HEADER_SIZE};
use crate::error::{CompileError, Result};
use crate::x64::inst::{AluOp, Cond, Inst, Label, LabelTable, Mem, Rm, Scale, ShiftAmount, ShiftOp, UnaryOp, Width};
use crate::x64::registers::Reg64::{self, *};

/// Linux x86-64 system call numbers
pub mod syscall {
    pub const SYS_READ: i64 = 0;
    pub const SYS_WRITE: i64 = 1;
    pub const SYS_EXIT: i64 = 60;

    // File descriptors
    pub const STDIN: i64 = 0;
    pub const STDOUT: i64 = 1;
    pub const STDERR: i64 = 2;
}

/// Exit status of a program stopped by `rt_panic`
pub const PANIC_STATUS: i64 = 70;

/// Entry labels of the runtime routines
#[derive(Debug, Clone, Copy)]
pub struct RuntimeLabels {
    pub alloc: Label,
    pub memcpy: Label,
    pub memset: Label,
    pub strlen: Label,
    pub streq: Label,
    pub concat: Label,
    pub fmt_int: Label,
    pub repeat: Label,
    pub read: Label,
    pub read_str: Label,
    pub write: Label,
    pub puts: Label,
    pub print_int: Label,
    pub print_bool: Label,
    pub enqueue: Label,
    pub dequeue: Label,
    pub panic: Label,
    pub exit: Label,
}

impl RuntimeLabels {
    pub fn declare(labels: &mut LabelTable) -> Result<Self> {
        Ok(Self {
            alloc: labels.named("rt_alloc")?,
            memcpy: labels.named("rt_memcpy")?,
            memset: labels.named("rt_memset")?,
            strlen: labels.named("rt_strlen")?,
            streq: labels.named("rt_streq")?,
            concat: labels.named("rt_concat")?,
            fmt_int: labels.named("rt_fmt_int")?,
            repeat: labels.named("rt_repeat")?,
            read: labels.named("rt_read")?,
            read_str: labels.named("rt_read_str")?,
            write: labels.named("rt_write")?,
            puts: labels.named("rt_puts")?,
            print_int: labels.named("rt_print_int")?,
            print_bool: labels.named("rt_print_bool")?,
            enqueue: labels.named("rt_enqueue")?,
            dequeue: labels.named("rt_dequeue")?,
            panic: labels.named("rt_panic")?,
            exit: labels.named("rt_exit")?,
        })
    }
}

#[inline]
fn mem(base: Reg64, disp: i32) -> Mem {
    Mem::disp(base, disp)
}

#[inline]
fn idx(base: Reg64, index: Reg64, disp: i32) -> Mem {
    Mem::indexed(base, index, Scale::S1, disp)
}

fn cmp_byte_zero(at: Mem) -> Inst {
    Inst::Alu {
        op: AluOp::Cmp,
        width: Width::W8,
        dst: at.into(),
        src: 0i64.into(),
    }
}

fn jshort(cond: Cond, target: Label) -> Inst {
    Inst::JccShort { cond, target }
}

/// Start a routine on a 16-byte boundary
fn begin(out: &mut Vec<Inst>, entry: Label) {
    out.push(Inst::Align(16));
    out.push(Inst::Label(entry));
}

/// Emit the whole runtime library into `ctx.text`
pub fn emit_runtime(ctx: &mut CodegenContext) -> Result<()> {
    let start = ctx.text.len();
    let mut out = Vec::new();

    emit_exit(ctx, &mut out);
    emit_panic(ctx, &mut out)?;
    emit_write(ctx, &mut out);
    emit_puts(ctx, &mut out);
    emit_strlen(ctx, &mut out);
    emit_streq(ctx, &mut out);
    emit_memcpy(ctx, &mut out);
    emit_memset(ctx, &mut out);
    emit_alloc(ctx, &mut out)?;
    emit_concat(ctx, &mut out);
    emit_fmt_int(ctx, &mut out);
    emit_repeat(ctx, &mut out);
    emit_read(ctx, &mut out);
    emit_read_str(ctx, &mut out);
    emit_print_int(ctx, &mut out);
    emit_print_bool(ctx, &mut out)?;
    emit_enqueue(ctx, &mut out)?;
    emit_dequeue(ctx, &mut out)?;

    ctx.text.extend(out);
    debug!(instructions = ctx.text.len() - start, "runtime library");
    Ok(())
}

fn emit_exit(ctx: &mut CodegenContext, out: &mut Vec<Inst>) {
    begin(out, ctx.rt.exit);
    out.push(Inst::mov(RAX, syscall::SYS_EXIT));
    out.push(Inst::Syscall);
    out.push(Inst::Ud2);
}

/// Message and newline to stderr, then exit with [`PANIC_STATUS`]
fn emit_panic(ctx: &mut CodegenContext, out: &mut Vec<Inst>) -> Result<()> {
    let newline = ctx.intern_str("\n")?;
    begin(out, ctx.rt.panic);
    out.push(Inst::alu(AluOp::Sub, RSP, 8));
    out.push(Inst::mov(RSI, RDI));
    out.push(Inst::mov(RDI, syscall::STDERR));
    out.push(Inst::Call(ctx.rt.puts));
    out.push(Inst::mov(RDI, syscall::STDERR));
    out.push(Inst::lea(RSI, Mem::sym(newline, 0)));
    out.push(Inst::Call(ctx.rt.puts));
    out.push(Inst::mov(RDI, PANIC_STATUS));
    out.push(Inst::Call(ctx.rt.exit));
    Ok(())
}

/// Loops until every byte is written or the kernel reports an error
fn emit_write(ctx: &mut CodegenContext, out: &mut Vec<Inst>) {
    let again = ctx.labels.fresh("write.again");
    let done = ctx.labels.fresh("write.done");
    begin(out, ctx.rt.write);
    out.push(Inst::Label(again));
    out.push(Inst::test(RDX));
    out.push(jshort(Cond::E, done));
    out.push(Inst::mov(RAX, syscall::SYS_WRITE));
    out.push(Inst::Syscall);
    out.push(Inst::test(RAX));
    out.push(jshort(Cond::LE, done));
    out.push(Inst::alu(AluOp::Add, RSI, RAX));
    out.push(Inst::alu(AluOp::Sub, RDX, RAX));
    out.push(Inst::JmpShort(again));
    out.push(Inst::Label(done));
    out.push(Inst::Ret);
}

fn emit_puts(ctx: &mut CodegenContext, out: &mut Vec<Inst>) {
    let scan = ctx.labels.fresh("puts.scan");
    let found = ctx.labels.fresh("puts.found");
    begin(out, ctx.rt.puts);
    out.push(Inst::zero(RDX));
    out.push(Inst::Label(scan));
    out.push(cmp_byte_zero(idx(RSI, RDX, 0)));
    out.push(jshort(Cond::E, found));
    out.push(Inst::alu(AluOp::Add, RDX, 1));
    out.push(Inst::JmpShort(scan));
    out.push(Inst::Label(found));
    out.push(Inst::Jmp(ctx.rt.write));
}

fn emit_strlen(ctx: &mut CodegenContext, out: &mut Vec<Inst>) {
    let scan = ctx.labels.fresh("strlen.scan");
    let done = ctx.labels.fresh("strlen.done");
    begin(out, ctx.rt.strlen);
    out.push(Inst::zero(RAX));
    out.push(Inst::Label(scan));
    out.push(cmp_byte_zero(idx(RDI, RAX, 0)));
    out.push(jshort(Cond::E, done));
    out.push(Inst::alu(AluOp::Add, RAX, 1));
    out.push(Inst::JmpShort(scan));
    out.push(Inst::Label(done));
    out.push(Inst::Ret);
}

fn emit_streq(ctx: &mut CodegenContext, out: &mut Vec<Inst>) {
    let scan = ctx.labels.fresh("streq.scan");
    let equal = ctx.labels.fresh("streq.equal");
    let differ = ctx.labels.fresh("streq.differ");
    begin(out, ctx.rt.streq);
    out.push(Inst::zero(RCX));
    out.push(Inst::Label(scan));
    out.push(Inst::MovZx8 {
        dst: RAX,
        src: Rm::Mem(idx(RDI, RCX, 0)),
    });
    out.push(Inst::MovZx8 {
        dst: RDX,
        src: Rm::Mem(idx(RSI, RCX, 0)),
    });
    out.push(Inst::alu(AluOp::Cmp, RAX, RDX));
    out.push(jshort(Cond::NE, differ));
    // both strings ended together
    out.push(Inst::test(RAX));
    out.push(jshort(Cond::E, equal));
    out.push(Inst::alu(AluOp::Add, RCX, 1));
    out.push(Inst::JmpShort(scan));
    out.push(Inst::Label(equal));
    out.push(Inst::mov(RAX, 1i64));
    out.push(Inst::Ret);
    out.push(Inst::Label(differ));
    out.push(Inst::zero(RAX));
    out.push(Inst::Ret);
}

fn emit_memcpy(ctx: &mut CodegenContext, out: &mut Vec<Inst>) {
    begin(out, ctx.rt.memcpy);
    out.push(Inst::mov(RAX, RDI));
    out.push(Inst::mov(RCX, RDX));
    out.push(Inst::RepMovsb);
    out.push(Inst::Ret);
}

fn emit_memset(ctx: &mut CodegenContext, out: &mut Vec<Inst>) {
    begin(out, ctx.rt.memset);
    out.push(Inst::mov(R8, RDI));
    out.push(Inst::mov(RAX, RSI));
    out.push(Inst::mov(RCX, RDX));
    out.push(Inst::RepStosb);
    out.push(Inst::mov(RAX, R8));
    out.push(Inst::Ret);
}

/// Bump allocation in 16-byte granules; the block is cleared through `rt_memset`
fn emit_alloc(ctx: &mut CodegenContext, out: &mut Vec<Inst>) -> Result<()> {
    let heap_size = i32::try_from(ctx.config.heap_size)
        .map_err(|_| CompileError::codegen_exhausted("heap size", ctx.config.heap_size, i32::MAX as u64))?;
    let oom = ctx.labels.fresh("alloc.oom");
    let message = ctx.intern_str("tidal: out of heap memory")?;

    begin(out, ctx.rt.alloc);
    // Reject sizes that would wrap when rounded
    out.push(Inst::alu(AluOp::Cmp, RDI, heap_size as i64));
    out.push(Inst::jcc(Cond::A, oom));
    out.push(Inst::alu(AluOp::Add, RDI, 15));
    out.push(Inst::alu(AluOp::And, RDI, -16));
    out.push(Inst::mov(RAX, Mem::sym(ctx.heap_ptr, 0)));
    out.push(Inst::lea(RCX, idx(RAX, RDI, 0)));
    out.push(Inst::lea(RDX, Mem::sym(ctx.heap, heap_size)));
    out.push(Inst::alu(AluOp::Cmp, RCX, RDX));
    out.push(Inst::jcc(Cond::A, oom));
    out.push(Inst::mov(Mem::sym(ctx.heap_ptr, 0), RCX));
    out.push(Inst::mov(RDX, RDI));
    out.push(Inst::mov(RDI, RAX));
    out.push(Inst::zero(RSI));
    out.push(Inst::Jmp(ctx.rt.memset));

    out.push(Inst::Label(oom));
    out.push(Inst::alu(AluOp::Sub, RSP, 8));
    out.push(Inst::lea(RDI, Mem::sym(message, 0)));
    out.push(Inst::Call(ctx.rt.panic));
    Ok(())
}

fn emit_concat(ctx: &mut CodegenContext, out: &mut Vec<Inst>) {
    begin(out, ctx.rt.concat);
    for reg in [R12, R13, R14, R15] {
        out.push(Inst::Push(reg));
    }
    out.push(Inst::alu(AluOp::Sub, RSP, 8));
    out.push(Inst::mov(R12, RDI));
    out.push(Inst::mov(R13, RSI));

    // r14 = len(a), r15 = len(b)
    out.push(Inst::Call(ctx.rt.strlen));
    out.push(Inst::mov(R14, RAX));
    out.push(Inst::mov(RDI, R13));
    out.push(Inst::Call(ctx.rt.strlen));
    out.push(Inst::mov(R15, RAX));

    out.push(Inst::lea(RDI, idx(R14, R15, 1)));
    out.push(Inst::Call(ctx.rt.alloc));

    out.push(Inst::mov(RDI, RAX));
    out.push(Inst::mov(RSI, R12));
    out.push(Inst::mov(RDX, R14));
    out.push(Inst::Call(ctx.rt.memcpy));
    // Second copy carries the terminator
    out.push(Inst::lea(RDI, idx(RAX, R14, 0)));
    out.push(Inst::mov(RSI, R13));
    out.push(Inst::lea(RDX, mem(R15, 1)));
    out.push(Inst::Call(ctx.rt.memcpy));
    out.push(Inst::alu(AluOp::Sub, RAX, R14));

    out.push(Inst::alu(AluOp::Add, RSP, 8));
    for reg in [R15, R14, R13, R12] {
        out.push(Inst::Pop(reg));
    }
    out.push(Inst::Ret);
}

/// Digits are written backwards from the end of a 32-byte block; the
/// magnitude is divided unsigned so `i64::MIN` prints correctly.
fn emit_fmt_int(ctx: &mut CodegenContext, out: &mut Vec<Inst>) {
    let positive = ctx.labels.fresh("fmt.positive");
    let digit = ctx.labels.fresh("fmt.digit");
    let done = ctx.labels.fresh("fmt.done");

    begin(out, ctx.rt.fmt_int);
    out.push(Inst::Push(R12));
    out.push(Inst::Push(R13));
    out.push(Inst::alu(AluOp::Sub, RSP, 8));
    out.push(Inst::mov(R12, RDI));
    out.push(Inst::mov(RDI, 32i64));
    out.push(Inst::Call(ctx.rt.alloc));
    out.push(Inst::mov(R13, RAX));

    // rcx walks down from the terminator at +31
    out.push(Inst::lea(RCX, mem(R13, 31)));
    out.push(Inst::mov(RAX, R12));
    out.push(Inst::test(RAX));
    out.push(jshort(Cond::NS, positive));
    out.push(Inst::Unary {
        op: UnaryOp::Neg,
        dst: Rm::Reg(RAX),
    });
    out.push(Inst::Label(positive));
    out.push(Inst::mov(R8, 10i64));

    out.push(Inst::Label(digit));
    out.push(Inst::zero(RDX));
    out.push(Inst::Unary {
        op: UnaryOp::Div,
        dst: Rm::Reg(R8),
    });
    out.push(Inst::alu(AluOp::Add, RDX, b'0' as i64));
    out.push(Inst::alu(AluOp::Sub, RCX, 1));
    out.push(Inst::mov_w(Width::W8, Mem::base(RCX), RDX));
    out.push(Inst::test(RAX));
    out.push(jshort(Cond::NE, digit));

    out.push(Inst::test(R12));
    out.push(jshort(Cond::NS, done));
    out.push(Inst::alu(AluOp::Sub, RCX, 1));
    out.push(Inst::mov_w(Width::W8, Mem::base(RCX), b'-' as i64));

    out.push(Inst::Label(done));
    out.push(Inst::mov(RAX, RCX));
    out.push(Inst::alu(AluOp::Add, RSP, 8));
    out.push(Inst::Pop(R13));
    out.push(Inst::Pop(R12));
    out.push(Inst::Ret);
}

/// Negative counts repeat zero times. A size that overflows is passed to
/// `rt_alloc` as `u64::MAX`, which its bound check rejects.
fn emit_repeat(ctx: &mut CodegenContext, out: &mut Vec<Inst>) {
    let counted = ctx.labels.fresh("repeat.counted");
    let fits = ctx.labels.fresh("repeat.fits");
    let sized = ctx.labels.fresh("repeat.sized");
    let copy = ctx.labels.fresh("repeat.copy");
    let done = ctx.labels.fresh("repeat.done");

    begin(out, ctx.rt.repeat);
    for reg in [R12, R13, R14, R15] {
        out.push(Inst::Push(reg));
    }
    out.push(Inst::alu(AluOp::Sub, RSP, 8));
    out.push(Inst::mov(R12, RDI));
    out.push(Inst::mov(R13, RSI));
    out.push(Inst::test(R13));
    out.push(jshort(Cond::NS, counted));
    out.push(Inst::zero(R13));
    out.push(Inst::Label(counted));

    out.push(Inst::Call(ctx.rt.strlen));
    out.push(Inst::mov(R14, RAX));
    out.push(Inst::mov(RDI, R14));
    out.push(Inst::Imul {
        dst: RDI,
        src: Rm::Reg(R13),
    });
    out.push(jshort(Cond::NO, fits));
    out.push(Inst::mov(RDI, -1i64));
    out.push(Inst::JmpShort(sized));
    out.push(Inst::Label(fits));
    out.push(Inst::alu(AluOp::Add, RDI, 1));
    out.push(Inst::Label(sized));
    out.push(Inst::Call(ctx.rt.alloc));
    out.push(Inst::mov(R15, RAX));
    // Write cursor lives in the pad slot
    out.push(Inst::mov(Mem::base(RSP), RAX));

    out.push(Inst::Label(copy));
    out.push(Inst::test(R13));
    out.push(jshort(Cond::E, done));
    out.push(Inst::mov(RDI, Mem::base(RSP)));
    out.push(Inst::mov(RSI, R12));
    out.push(Inst::mov(RDX, R14));
    out.push(Inst::Call(ctx.rt.memcpy));
    out.push(Inst::alu(AluOp::Add, RAX, R14));
    out.push(Inst::mov(Mem::base(RSP), RAX));
    out.push(Inst::alu(AluOp::Sub, R13, 1));
    out.push(Inst::JmpShort(copy));

    out.push(Inst::Label(done));
    out.push(Inst::mov(RAX, R15));
    out.push(Inst::alu(AluOp::Add, RSP, 8));
    for reg in [R15, R14, R13, R12] {
        out.push(Inst::Pop(reg));
    }
    out.push(Inst::Ret);
}

fn emit_read(ctx: &mut CodegenContext, out: &mut Vec<Inst>) {
    begin(out, ctx.rt.read);
    out.push(Inst::mov(RAX, syscall::SYS_READ));
    out.push(Inst::Syscall);
    out.push(Inst::Ret);
}

/// One `read` from stdin into a fresh zeroed buffer of `max + 1` bytes;
/// end of input and errors leave the empty string.
fn emit_read_str(ctx: &mut CodegenContext, out: &mut Vec<Inst>) {
    begin(out, ctx.rt.read_str);
    out.push(Inst::Push(R12));
    out.push(Inst::Push(R13));
    out.push(Inst::alu(AluOp::Sub, RSP, 8));
    out.push(Inst::mov(R12, RDI));
    out.push(Inst::lea(RDI, mem(R12, 1)));
    out.push(Inst::Call(ctx.rt.alloc));
    out.push(Inst::mov(R13, RAX));
    out.push(Inst::mov(RDI, syscall::STDIN));
    out.push(Inst::mov(RSI, R13));
    out.push(Inst::mov(RDX, R12));
    out.push(Inst::Call(ctx.rt.read));
    out.push(Inst::mov(RAX, R13));
    out.push(Inst::alu(AluOp::Add, RSP, 8));
    out.push(Inst::Pop(R13));
    out.push(Inst::Pop(R12));
    out.push(Inst::Ret);
}

fn emit_print_int(ctx: &mut CodegenContext, out: &mut Vec<Inst>) {
    begin(out, ctx.rt.print_int);
    out.push(Inst::Push(R12));
    out.push(Inst::mov(R12, RDI));
    out.push(Inst::mov(RDI, RSI));
    out.push(Inst::Call(ctx.rt.fmt_int));
    out.push(Inst::mov(RDI, R12));
    out.push(Inst::mov(RSI, RAX));
    out.push(Inst::Pop(R12));
    out.push(Inst::Jmp(ctx.rt.puts));
}

fn emit_print_bool(ctx: &mut CodegenContext, out: &mut Vec<Inst>) -> Result<()> {
    let yes = ctx.intern_str("true")?;
    let no = ctx.intern_str("false")?;
    let is_false = ctx.labels.fresh("print_bool.false");
    begin(out, ctx.rt.print_bool);
    out.push(Inst::test(RSI));
    out.push(jshort(Cond::E, is_false));
    out.push(Inst::lea(RSI, Mem::sym(yes, 0)));
    out.push(Inst::Jmp(ctx.rt.puts));
    out.push(Inst::Label(is_false));
    out.push(Inst::lea(RSI, Mem::sym(no, 0)));
    out.push(Inst::Jmp(ctx.rt.puts));
    Ok(())
}

/// Append `{schema id, payload}` at `(head + len) % capacity`
fn emit_enqueue(ctx: &mut CodegenContext, out: &mut Vec<Inst>) -> Result<()> {
    let capacity = ctx.config.queue_capacity as i64;
    let entries = QUEUE_HEADER_SIZE as i32;
    let in_range = ctx.labels.fresh("enqueue.in_range");
    let overflow = ctx.labels.fresh("enqueue.overflow");
    let message = ctx.intern_str("tidal: message queue overflow")?;

    begin(out, ctx.rt.enqueue);
    out.push(Inst::mov(RAX, mem(RDI, 8)));
    out.push(Inst::alu(AluOp::Cmp, RAX, capacity));
    out.push(Inst::jcc(Cond::AE, overflow));
    out.push(Inst::mov(RCX, Mem::base(RDI)));
    out.push(Inst::alu(AluOp::Add, RCX, RAX));
    out.push(Inst::alu(AluOp::Cmp, RCX, capacity));
    out.push(jshort(Cond::B, in_range));
    out.push(Inst::alu(AluOp::Sub, RCX, capacity));
    out.push(Inst::Label(in_range));
    out.push(Inst::Shift {
        op: ShiftOp::Shl,
        dst: Rm::Reg(RCX),
        amount: ShiftAmount::Imm(4),
    });
    out.push(Inst::mov(idx(RDI, RCX, entries), RSI));
    out.push(Inst::mov(idx(RDI, RCX, entries + 8), RDX));
    out.push(Inst::alu(AluOp::Add, RAX, 1));
    out.push(Inst::mov(mem(RDI, 8), RAX));
    out.push(Inst::Ret);

    out.push(Inst::Label(overflow));
    out.push(Inst::alu(AluOp::Sub, RSP, 8));
    out.push(Inst::lea(RDI, Mem::sym(message, 0)));
    out.push(Inst::Call(ctx.rt.panic));
    Ok(())
}

/// Move the head entry into the slot and mark it active; no-op on an empty queue
fn emit_dequeue(ctx: &mut CodegenContext, out: &mut Vec<Inst>) -> Result<()> {
    let capacity = ctx.config.queue_capacity as i64;
    let entries = QUEUE_HEADER_SIZE as i32;
    let empty = ctx.labels.fresh("dequeue.empty");
    let in_range = ctx.labels.fresh("dequeue.in_range");

    begin(out, ctx.rt.dequeue);
    out.push(Inst::mov(RAX, mem(RDI, 8)));
    out.push(Inst::test(RAX));
    out.push(Inst::jcc(Cond::E, empty));
    out.push(Inst::mov(RCX, Mem::base(RDI)));
    out.push(Inst::mov(RDX, RCX));
    out.push(Inst::Shift {
        op: ShiftOp::Shl,
        dst: Rm::Reg(RDX),
        amount: ShiftAmount::Imm(4),
    });
    out.push(Inst::mov(R8, idx(RDI, RDX, entries)));
    out.push(Inst::mov(mem(RSI, 8), R8));
    out.push(Inst::mov(R8, idx(RDI, RDX, entries + 8)));
    out.push(Inst::mov(mem(RSI, 16), R8));
    out.push(Inst::mov(Mem::base(RSI), 1i64));

    out.push(Inst::alu(AluOp::Add, RCX, 1));
    out.push(Inst::alu(AluOp::Cmp, RCX, capacity));
    out.push(jshort(Cond::B, in_range));
    out.push(Inst::zero(RCX));
    out.push(Inst::Label(in_range));
    out.push(Inst::mov(Mem::base(RDI), RCX));
    out.push(Inst::alu(AluOp::Sub, RAX, 1));
    out.push(Inst::mov(mem(RDI, 8), RAX));
    out.push(Inst::Label(empty));
    out.push(Inst::Ret);
    Ok(())
}
