//! Agent Program to x64 Code Generation
//!
//! Lowers an analyzed program to one flat [`Inst`] stream plus the data
//! sections it refers to. The stream is laid out as
//!
//! ```text
//! _start (scheduler) | handlers and helpers, per agent | runtime library
//! ```
//!
//! All emitters share one [`CodegenContext`] passed by `&mut`; per-routine
//! state (scratch registers, locals, frame size) lives in a
//! [`FunctionBuilder`].
//!
//! ## Register roles inside handlers and helpers
//!
//! | Register              | Role                                     |
//! |-----------------------|------------------------------------------|
//! | r12                   | agent state base                         |
//! | r13                   | inbound message payload                  |
//! | rbx, r14, r15, r10, r11 | expression scratch, LIFO               |
//! | rax, rcx, rdx         | fixed operands (division, shifts, calls) |

pub mod expr;
pub mod handler;
pub mod runtime;
pub mod scheduler;
pub mod stmt;

use std::collections::HashMap;

use tracing::{debug, info};

use crate::config::CompileConfig;
use crate::error::{CompileError, Result};
use crate::layout::{AgentLayout, Layout, SchemaLayout};
use crate::model::{AgentTemplate, ExprType, Literal, ProgramModel, ValueType};
use crate::x64::inst::{AluOp, Inst, Label, LabelTable, Mem, Operand, Rm, Width};
use crate::x64::registers::{Reg64, SCRATCH_POOL, SYSV_ARG_REGS, SYSV_RET_REG};
use crate::x64::symbols::{DataSection, RelocKind, Relocation, SectionKind, SymbolId, SymbolTable};

use self::runtime::RuntimeLabels;

/// Bytes of one queue entry: schema id, payload pointer
pub const QUEUE_ENTRY_SIZE: u64 = 16;
/// Queue header: head index, pending count
pub const QUEUE_HEADER_SIZE: u64 = 16;
/// Dispatch slot: active flag, schema id, payload pointer
pub const SLOT_SIZE: u64 = 24;

/// Per-agent scheduler storage in `.bss`
#[derive(Debug, Clone, Copy)]
pub struct AgentStorage {
    pub queue: SymbolId,
    pub slot: SymbolId,
}

/// Shared state of one code generation run
pub struct CodegenContext<'a> {
    pub model: &'a ProgramModel,
    pub layout: &'a Layout,
    pub config: &'a CompileConfig,
    pub labels: LabelTable,
    pub symbols: SymbolTable,
    pub rodata: DataSection,
    pub data: DataSection,
    pub bss: DataSection,
    /// Relocations whose site lies in `.data`
    pub data_relocs: Vec<Relocation>,
    /// Final instruction stream
    pub text: Vec<Inst>,
    pub rt: RuntimeLabels,
    /// Start of the agent state arena
    pub state: SymbolId,
    pub heap: SymbolId,
    pub heap_ptr: SymbolId,
    storage: HashMap<String, AgentStorage>,
    handler_labels: HashMap<(String, String), Label>,
    helper_labels: HashMap<(String, String), Label>,
    strings: HashMap<String, SymbolId>,
    wide_ints: HashMap<i64, SymbolId>,
}

impl<'a> CodegenContext<'a> {
    /// Create the context: entry labels for every routine and all data symbols
    pub fn new(model: &'a ProgramModel, layout: &'a Layout, config: &'a CompileConfig) -> Result<Self> {
        let mut labels = LabelTable::new();
        let mut symbols = SymbolTable::new();
        let rt = RuntimeLabels::declare(&mut labels)?;

        let mut handler_labels = HashMap::new();
        let mut helper_labels = HashMap::new();
        for agent in layout.agents() {
            for (schema, unit) in layout.agent_handlers(&agent.name) {
                let label = labels.named(&unit.label)?;
                handler_labels.insert((agent.name.clone(), schema.name.clone()), label);
            }
            if let Some(template) = model.template(&agent.template) {
                for helper in &template.helpers {
                    let label = labels.named(&format!("helper.{}.{}", agent.name, helper.name))?;
                    helper_labels.insert((agent.name.clone(), helper.name.clone()), label);
                }
            }
        }

        let mut ctx = Self {
            model,
            layout,
            config,
            labels,
            state: symbols.declare("agent_state", SectionKind::Data),
            heap: symbols.declare("heap", SectionKind::Bss),
            heap_ptr: symbols.declare("heap_ptr", SectionKind::Data),
            symbols,
            rodata: DataSection::new(SectionKind::Rodata),
            data: DataSection::new(SectionKind::Data),
            bss: DataSection::new(SectionKind::Bss),
            data_relocs: Vec::new(),
            text: Vec::new(),
            rt,
            storage: HashMap::new(),
            handler_labels,
            helper_labels,
            strings: HashMap::new(),
            wide_ints: HashMap::new(),
        };
        ctx.lay_out_data()?;
        Ok(ctx)
    }

    /// Initial agent state, the heap pointer, queues, slots and the heap
    fn lay_out_data(&mut self) -> Result<()> {
        let layout = self.layout;
        let model = self.model;

        let mut arena = vec![0u8; layout.state_size() as usize];
        let mut string_inits = Vec::new();
        for agent in layout.agents() {
            let Some(template) = model.template(&agent.template) else {
                continue;
            };
            for field in &template.state {
                let Some(slot) = agent.state.field(&field.name) else {
                    continue;
                };
                let at = (agent.base + slot.offset) as usize;
                match (&field.init, field.ty) {
                    (_, ValueType::Str) => {
                        let text = match &field.init {
                            Some(Literal::Str(s)) => s.as_str(),
                            _ => "",
                        };
                        string_inits.push((at as u64, text.to_string()));
                    }
                    (Some(lit), ty) => {
                        let value = match lit {
                            Literal::Bool(b) => *b as i64,
                            Literal::Int(v) => *v,
                            Literal::Str(_) => 0,
                        };
                        let bytes = value.to_le_bytes();
                        let size = ty.size() as usize;
                        arena[at..at + size].copy_from_slice(&bytes[..size]);
                    }
                    (None, _) => {}
                }
            }
        }
        // Keep the arena non-empty so `agent_state` always has an address
        if arena.is_empty() {
            arena.resize(8, 0);
        }
        let state_off = self.data.append(&arena, 16);
        self.symbols.bind(self.state, state_off)?;
        for (at, text) in string_inits {
            let sym = self.intern_str(&text)?;
            self.data_relocs.push(Relocation {
                section: SectionKind::Data,
                offset: state_off + at,
                symbol: sym,
                kind: RelocKind::Abs64,
                addend: 0,
            });
        }

        let ptr_off = self.data.append(&[0u8; 8], 8);
        self.symbols.bind(self.heap_ptr, ptr_off)?;
        self.data_relocs.push(Relocation {
            section: SectionKind::Data,
            offset: ptr_off,
            symbol: self.heap,
            kind: RelocKind::Abs64,
            addend: 0,
        });

        let queue_size = QUEUE_HEADER_SIZE + self.config.queue_capacity as u64 * QUEUE_ENTRY_SIZE;
        for agent in layout.agents() {
            if layout.agent_handlers(&agent.name).next().is_none() {
                continue;
            }
            let queue_off = self.bss.reserve(queue_size, 16);
            let queue = self
                .symbols
                .define(&format!("queue.{}", agent.name), SectionKind::Bss, queue_off)?;
            let slot_off = self.bss.reserve(SLOT_SIZE, 16);
            let slot = self
                .symbols
                .define(&format!("slot.{}", agent.name), SectionKind::Bss, slot_off)?;
            self.storage
                .insert(agent.name.clone(), AgentStorage { queue, slot });
        }

        // The heap goes last so everything else stays close to the code
        let heap_off = self.bss.reserve(self.config.heap_size, 16);
        self.symbols.bind(self.heap, heap_off)?;
        Ok(())
    }

    /// Pool a NUL-terminated string in `.rodata`, reusing identical content
    pub fn intern_str(&mut self, text: &str) -> Result<SymbolId> {
        if let Some(&sym) = self.strings.get(text) {
            return Ok(sym);
        }
        if text.as_bytes().contains(&0) {
            return Err(CompileError::type_error(
                format!("string literal {:?}", text),
                "string contains a NUL byte",
            ));
        }
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        let offset = self.rodata.append(&bytes, 1);
        let name = format!("str.{}", self.strings.len());
        let sym = self.symbols.define(&name, SectionKind::Rodata, offset)?;
        self.strings.insert(text.to_string(), sym);
        Ok(sym)
    }

    /// Pool a constant too wide for an imm32 in `.rodata`
    pub fn intern_i64(&mut self, value: i64) -> Result<SymbolId> {
        if let Some(&sym) = self.wide_ints.get(&value) {
            return Ok(sym);
        }
        let offset = self.rodata.append(&value.to_le_bytes(), 8);
        let name = format!("i64.{}", self.wide_ints.len());
        let sym = self.symbols.define(&name, SectionKind::Rodata, offset)?;
        self.wide_ints.insert(value, sym);
        Ok(sym)
    }

    pub fn storage(&self, agent: &str) -> Option<AgentStorage> {
        self.storage.get(agent).copied()
    }

    pub fn handler_label(&self, agent: &str, schema: &str) -> Option<Label> {
        self.handler_labels
            .get(&(agent.to_string(), schema.to_string()))
            .copied()
    }

    pub fn helper_label(&self, agent: &str, helper: &str) -> Option<Label> {
        self.helper_labels
            .get(&(agent.to_string(), helper.to_string()))
            .copied()
    }
}

/// Argument of a call emitted by [`FunctionBuilder::emit_call`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallArg {
    Reg(Reg64),
    Imm(i64),
    /// Address of a data symbol, loaded with a RIP-relative `lea`
    Addr(SymbolId, i32),
}

/// A computed value held in a scratch register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Value {
    pub reg: Reg64,
    pub ty: ExprType,
}

/// Frame-resident local variable or helper parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Local {
    pub slot: u32,
    pub ty: ExprType,
}

/// What a `return` statement produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    /// Handler status code (0 = keep running)
    Status,
    /// Helper result; `None` returns 0
    Value(Option<ValueType>),
}

/// Per-routine code generation state
pub struct FunctionBuilder<'a> {
    /// Label name of the routine, used in diagnostics
    pub name: String,
    pub insts: Vec<Inst>,
    pub agent: &'a AgentLayout,
    pub template: &'a AgentTemplate,
    /// Inbound schema (`None` inside helpers)
    pub message: Option<&'a SchemaLayout>,
    pub returns: ReturnKind,
    pub epilogue: Label,
    depth: usize,
    max_depth: usize,
    scopes: Vec<Vec<(String, Local)>>,
    slots: u32,
}

impl<'a> FunctionBuilder<'a> {
    pub fn new(
        name: impl Into<String>,
        agent: &'a AgentLayout,
        template: &'a AgentTemplate,
        message: Option<&'a SchemaLayout>,
        returns: ReturnKind,
        epilogue: Label,
    ) -> Self {
        Self {
            name: name.into(),
            insts: Vec::new(),
            agent,
            template,
            message,
            returns,
            epilogue,
            depth: 0,
            max_depth: 0,
            scopes: vec![Vec::new()],
            slots: 0,
        }
    }

    #[inline]
    pub fn emit(&mut self, inst: Inst) {
        self.insts.push(inst);
    }

    /// Take the next scratch register
    pub fn alloc(&mut self) -> Result<Reg64> {
        if self.depth == SCRATCH_POOL.len() {
            return Err(CompileError::codegen_exhausted(
                format!("scratch registers in {} (expression too deep)", self.name),
                self.depth as u64 + 1,
                SCRATCH_POOL.len() as u64,
            ));
        }
        let reg = SCRATCH_POOL[self.depth];
        self.depth += 1;
        self.max_depth = self.max_depth.max(self.depth);
        Ok(reg)
    }

    /// Release the most recently allocated scratch register
    pub fn free(&mut self, reg: Reg64) {
        debug_assert!(self.depth > 0 && SCRATCH_POOL[self.depth - 1] == reg);
        self.depth -= 1;
    }

    /// Scratch registers currently holding values
    pub fn live(&self) -> &[Reg64] {
        &SCRATCH_POOL[..self.depth]
    }

    /// Callee-saved scratch registers the body touched
    pub fn clobbered_callee_saved(&self) -> Vec<Reg64> {
        SCRATCH_POOL[..self.max_depth]
            .iter()
            .copied()
            .filter(|r| r.is_callee_saved())
            .collect()
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    /// Reserve a frame slot for a new name in the innermost scope
    pub fn declare_local(&mut self, name: &str, ty: ExprType) -> Result<Local> {
        let scope = self
            .scopes
            .last_mut()
            .ok_or_else(|| CompileError::reference(name, "no open scope"))?;
        if scope.iter().any(|(n, _)| n == name) {
            return Err(CompileError::reference(
                format!("local `{}` in {}", name, self.name),
                "declared twice in one scope",
            ));
        }
        let local = Local {
            slot: self.slots,
            ty,
        };
        self.slots += 1;
        scope.push((name.to_string(), local));
        Ok(local)
    }

    pub fn lookup_local(&self, name: &str) -> Option<Local> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|(n, _)| n == name)
            .map(|(_, local)| *local)
    }

    pub fn slot_count(&self) -> u32 {
        self.slots
    }

    /// `[rbp - 8 * (slot + 1)]`
    pub fn local_mem(slot: u32) -> Mem {
        Mem::disp(Reg64::RBP, -8 * (slot as i32 + 1))
    }

    /// Load a typed field into a 64-bit register
    pub fn load(&mut self, dst: Reg64, src: Mem, ty: ValueType) {
        let inst = match ty {
            ValueType::Bool => Inst::MovZx8 {
                dst,
                src: Rm::Mem(src),
            },
            ValueType::I32 => Inst::MovSx32 {
                dst,
                src: Rm::Mem(src),
            },
            ValueType::I64 | ValueType::Str => Inst::mov(dst, src),
        };
        self.emit(inst);
    }

    /// Store the low bytes of a register into a typed field
    pub fn store(&mut self, dst: Mem, src: Reg64, ty: ValueType) {
        let width = match ty {
            ValueType::Bool => Width::W8,
            ValueType::I32 => Width::W32,
            ValueType::I64 | ValueType::Str => Width::W64,
        };
        self.emit(Inst::mov_w(width, dst, src));
    }

    /// Call a routine following System V.
    ///
    /// Live caller-saved scratch registers are pushed around the call, plus
    /// an 8-byte pad when their count is odd, so `rsp` stays 16-byte aligned.
    /// Argument values must not live in argument registers.
    pub fn emit_call(&mut self, target: Label, args: &[CallArg]) -> Result<()> {
        if args.len() > SYSV_ARG_REGS.len() {
            return Err(CompileError::codegen_exhausted(
                format!("call arguments in {}", self.name),
                args.len() as u64,
                SYSV_ARG_REGS.len() as u64,
            ));
        }
        let saved: Vec<Reg64> = self
            .live()
            .iter()
            .copied()
            .filter(|r| r.is_caller_saved())
            .collect();
        let pad = saved.len() % 2 == 1;

        for &reg in &saved {
            self.emit(Inst::Push(reg));
        }
        if pad {
            self.emit(Inst::alu(AluOp::Sub, Reg64::RSP, 8));
        }
        for (arg, &dst) in args.iter().zip(SYSV_ARG_REGS.iter()) {
            match *arg {
                CallArg::Reg(src) if src == dst => {}
                CallArg::Reg(src) => self.emit(Inst::mov(dst, src)),
                CallArg::Imm(v) => self.emit(Inst::mov(dst, Operand::Imm(v))),
                CallArg::Addr(sym, addend) => self.emit(Inst::lea(dst, Mem::sym(sym, addend))),
            }
        }
        self.emit(Inst::Call(target));
        if pad {
            self.emit(Inst::alu(AluOp::Add, Reg64::RSP, 8));
        }
        for &reg in saved.iter().rev() {
            self.emit(Inst::Pop(reg));
        }
        Ok(())
    }

    /// Call, then move the return value into a fresh scratch register
    pub fn emit_call_value(&mut self, target: Label, args: &[CallArg], ty: ExprType) -> Result<Value> {
        self.emit_call(target, args)?;
        let reg = self.alloc()?;
        self.emit(Inst::mov(reg, SYSV_RET_REG));
        Ok(Value { reg, ty })
    }
}

/// Output of [`generate`], ready for the assembler
#[derive(Debug)]
pub struct Program {
    pub insts: Vec<Inst>,
    pub labels: LabelTable,
    pub symbols: SymbolTable,
    pub rodata: DataSection,
    pub data: DataSection,
    pub bss: DataSection,
    pub data_relocs: Vec<Relocation>,
    /// `_start`
    pub entry: Label,
}

/// Generate the complete instruction stream and data sections
pub fn generate(model: &ProgramModel, layout: &Layout, config: &CompileConfig) -> Result<Program> {
    let mut ctx = CodegenContext::new(model, layout, config)?;

    let entry = scheduler::emit_scheduler(&mut ctx)?;

    for agent in layout.agents() {
        let template = model.template(&agent.template).ok_or_else(|| {
            CompileError::reference(
                format!("agent `{}`", agent.name),
                format!("unknown template `{}`", agent.template),
            )
        })?;
        for h in &template.handlers {
            handler::emit_handler(&mut ctx, agent, template, h)?;
        }
        for helper in &template.helpers {
            handler::emit_helper(&mut ctx, agent, template, helper)?;
        }
    }

    runtime::emit_runtime(&mut ctx)?;

    info!(
        instructions = ctx.text.len(),
        labels = ctx.labels.len(),
        symbols = ctx.symbols.len(),
        rodata = ctx.rodata.len(),
        data = ctx.data.len(),
        bss = ctx.bss.len(),
        "code generation complete"
    );
    debug!(strings = ctx.strings.len(), wide_ints = ctx.wide_ints.len(), "constant pool");

    Ok(Program {
        insts: ctx.text,
        labels: ctx.labels,
        symbols: ctx.symbols,
        rodata: ctx.rodata,
        data: ctx.data,
        bss: ctx.bss,
        data_relocs: ctx.data_relocs,
        entry,
    })
}

/// Walk an instruction stream and report every `call` made with `rsp` off a
/// 16-byte boundary. Routines start after `Align(16)` with the return address
/// pushed; `and rsp, -16` realigns.
#[cfg(test)]
pub(crate) fn misaligned_calls(insts: &[Inst], labels: &LabelTable) -> Vec<String> {
    let mut bad = Vec::new();
    // bytes below the last 16-byte boundary
    let mut depth: i64 = 8;
    let mut frame_base: i64 = 0;
    let mut current = String::new();
    let mut after_align = false;

    for inst in insts {
        match inst {
            Inst::Align(16) => {
                after_align = true;
                continue;
            }
            Inst::Label(l) if after_align => {
                depth = 8;
                current = labels.name(*l).to_string();
            }
            Inst::Push(_) => depth += 8,
            Inst::Pop(_) => depth -= 8,
            Inst::Alu {
                op,
                dst: Operand::Reg(Reg64::RSP),
                src: Operand::Imm(n),
                ..
            } => match op {
                AluOp::Sub => depth += n,
                AluOp::Add => depth -= n,
                AluOp::And => depth = 0,
                _ => {}
            },
            Inst::Mov {
                dst: Operand::Reg(Reg64::RBP),
                src: Operand::Reg(Reg64::RSP),
                ..
            } => frame_base = depth,
            Inst::Mov {
                dst: Operand::Reg(Reg64::RSP),
                src: Operand::Reg(Reg64::RBP),
                ..
            } => depth = frame_base,
            Inst::Call(target) if depth.rem_euclid(16) != 0 => {
                bad.push(format!(
                    "{}: call {} at depth {}",
                    current,
                    labels.name(*target),
                    depth
                ));
            }
            _ => {}
        }
        after_align = false;
    }
    bad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::analyze;

    pub(crate) fn program(json: &str) -> (ProgramModel, CompileConfig) {
        (ProgramModel::from_json(json).unwrap(), CompileConfig::default())
    }

    const PINGER: &str = r#"{
        "schemas": [{"name": "Ping", "fields": [{"name": "n", "type": "i64"},
                                                {"name": "tag", "type": "str"}]}],
        "templates": [{
            "name": "Pinger",
            "state": [{"name": "greeting", "type": "str", "init": "hello"},
                      {"name": "count", "type": "i32", "init": 5}],
            "handlers": [{"schema": "Ping", "body": [
                {"kind": "write", "value": {"kind": "state", "field": "greeting"}},
                {"kind": "write", "value": {"kind": "binary", "op": "div",
                    "lhs": {"kind": "field", "field": "n"},
                    "rhs": {"kind": "int", "value": 3000000000}}}
            ]}]
        }],
        "instances": [{"name": "a", "template": "Pinger"}, {"name": "b", "template": "Pinger"}],
        "routes": [{"from": "external", "schema": "Ping", "to": ["a", "b"]}],
        "seed": {"schema": "Ping", "fields": {"n": 1, "tag": "hello"}}
    }"#;

    #[test]
    fn test_string_pool_deduplicates() {
        let (model, config) = program(PINGER);
        let layout = analyze(&model, &config).unwrap();
        let mut ctx = CodegenContext::new(&model, &layout, &config).unwrap();
        // both agents initialize `greeting` to "hello": one pooled copy
        let first = ctx.intern_str("hello").unwrap();
        assert_eq!(ctx.strings.len(), 1);
        let again = ctx.intern_str("hello").unwrap();
        assert_eq!(first, again);
        let other = ctx.intern_str("world").unwrap();
        assert_ne!(first, other);
        assert_eq!(ctx.data_relocs.len(), 3); // two string inits, heap_ptr
    }

    #[test]
    fn test_state_initial_values() {
        let (model, config) = program(PINGER);
        let layout = analyze(&model, &config).unwrap();
        let ctx = CodegenContext::new(&model, &layout, &config).unwrap();
        let b = layout.agent("b").unwrap();
        let count = b.state.field("count").unwrap();
        let at = (b.base + count.offset) as usize;
        assert_eq!(&ctx.data.bytes()[at..at + 4], &5i32.to_le_bytes());
    }

    #[test]
    fn test_every_agent_with_handlers_gets_storage() {
        let (model, config) = program(PINGER);
        let layout = analyze(&model, &config).unwrap();
        let ctx = CodegenContext::new(&model, &layout, &config).unwrap();
        assert!(ctx.storage("a").is_some());
        assert!(ctx.storage("b").is_some());
        assert!(ctx.handler_label("a", "Ping").is_some());
        // heap is the last bss object
        let heap = ctx.symbols.get(ctx.heap);
        assert_eq!(heap.offset + config.heap_size, ctx.bss.len());
    }

    #[test]
    fn test_scratch_pool_is_lifo_and_bounded() {
        let (model, config) = program(PINGER);
        let layout = analyze(&model, &config).unwrap();
        let agent = layout.agent("a").unwrap();
        let template = &model.templates[0];
        let mut labels = LabelTable::new();
        let epi = labels.fresh("epilogue");
        let mut fb = FunctionBuilder::new("test", agent, template, None, ReturnKind::Status, epi);
        let regs: Vec<Reg64> = (0..5).map(|_| fb.alloc().unwrap()).collect();
        assert_eq!(regs, SCRATCH_POOL.to_vec());
        assert!(matches!(
            fb.alloc(),
            Err(CompileError::ResourceExhaustion { .. })
        ));
        for reg in regs.into_iter().rev() {
            fb.free(reg);
        }
        assert!(fb.live().is_empty());
        assert_eq!(
            fb.clobbered_callee_saved(),
            vec![Reg64::RBX, Reg64::R14, Reg64::R15]
        );
    }

    #[test]
    fn test_call_pads_odd_saved_registers() {
        let (model, config) = program(PINGER);
        let layout = analyze(&model, &config).unwrap();
        let agent = layout.agent("a").unwrap();
        let template = &model.templates[0];
        let mut labels = LabelTable::new();
        let epi = labels.fresh("epilogue");
        let target = labels.fresh("target");
        let mut fb = FunctionBuilder::new("test", agent, template, None, ReturnKind::Status, epi);
        // rbx, r14, r15 are callee-saved; r10 is the first one pushed
        for _ in 0..4 {
            fb.alloc().unwrap();
        }
        fb.emit_call(target, &[CallArg::Imm(1)]).unwrap();
        assert_eq!(
            fb.insts,
            vec![
                Inst::Push(Reg64::R10),
                Inst::alu(AluOp::Sub, Reg64::RSP, 8),
                Inst::mov(Reg64::RDI, Operand::Imm(1)),
                Inst::Call(target),
                Inst::alu(AluOp::Add, Reg64::RSP, 8),
                Inst::Pop(Reg64::R10),
            ]
        );
    }

    #[test]
    fn test_every_call_is_aligned() {
        let (model, config) = program(PINGER);
        let layout = analyze(&model, &config).unwrap();
        let program = generate(&model, &layout, &config).unwrap();
        let bad = misaligned_calls(&program.insts, &program.labels);
        assert!(bad.is_empty(), "misaligned calls: {:#?}", bad);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let (model, config) = program(PINGER);
        let layout = analyze(&model, &config).unwrap();
        let a = generate(&model, &layout, &config).unwrap();
        let b = generate(&model, &layout, &config).unwrap();
        assert_eq!(a.insts, b.insts);
        assert_eq!(a.rodata.bytes(), b.rodata.bytes());
    }
}
