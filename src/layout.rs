//! Layout Analysis
//!
//! Turns a [`ProgramModel`] into the fixed facts code generation relies on:
//! field offsets for every schema and agent state record, one
//! non-overlapping region per agent instance inside the state arena, the
//! static routing table and one [`HandlerUnit`] per (agent, schema) pair.
//!
//! Every name in the model is resolved here, so later stages only fail on
//! problems inside handler bodies.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use tracing::{debug, info};

use crate::config::CompileConfig;
use crate::error::{CompileError, Result};
use crate::model::{Endpoint, ExprType, FieldDecl, Literal, ProgramModel, ValueType};
use crate::x64::symbols::align_up;

/// Alignment of every agent region inside the state arena
pub const AGENT_ALIGN: u64 = 16;
/// Smallest region handed to an agent, so bases stay unique for stateless agents
pub const MIN_AGENT_SIZE: u64 = 8;
/// Helper parameters travel in rdx, rcx, r8, r9
pub const MAX_HELPER_PARAMS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSlot {
    pub name: String,
    pub ty: ValueType,
    pub offset: u64,
}

/// Packed, type-aligned record (a message payload or an agent state)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordLayout {
    pub fields: Vec<FieldSlot>,
    pub size: u64,
    pub align: u64,
}

impl RecordLayout {
    fn build(owner: &str, decls: &[FieldDecl]) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(decls.len());
        let mut offset = 0;
        let mut align = 1;
        for decl in decls {
            if !seen.insert(decl.name.as_str()) {
                return Err(CompileError::reference(
                    format!("{}.{}", owner, decl.name),
                    "field declared twice",
                ));
            }
            offset = align_up(offset, decl.ty.align());
            fields.push(FieldSlot {
                name: decl.name.clone(),
                ty: decl.ty,
                offset,
            });
            offset += decl.ty.size();
            align = align.max(decl.ty.align());
        }
        Ok(Self {
            fields,
            size: align_up(offset, align),
            align,
        })
    }

    pub fn field(&self, name: &str) -> Option<&FieldSlot> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaLayout {
    pub name: String,
    /// Dispatch id carried in queue entries, from 1 in declaration order
    pub id: u32,
    pub record: RecordLayout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLayout {
    pub name: String,
    pub template: String,
    /// Offset of this agent's region inside the state arena
    pub base: u64,
    /// Region size (at least [`MIN_AGENT_SIZE`])
    pub size: u64,
    pub state: RecordLayout,
}

/// Static dispatch target for one (agent, schema) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerUnit {
    pub agent: String,
    pub schema: String,
    /// Label of the generated routine
    pub label: String,
}

/// (source, schema) → ordered destinations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEdge {
    pub from: Endpoint,
    pub schema: String,
    pub to: Vec<String>,
}

/// Output of [`analyze`]; read-only for the rest of the pipeline
#[derive(Debug, Clone)]
pub struct Layout {
    schemas: Vec<SchemaLayout>,
    agents: Vec<AgentLayout>,
    routes: BTreeMap<(Endpoint, String), Vec<String>>,
    handlers: BTreeMap<(String, String), HandlerUnit>,
    state_size: u64,
}

impl Layout {
    pub fn schemas(&self) -> &[SchemaLayout] {
        &self.schemas
    }

    pub fn schema(&self, name: &str) -> Option<&SchemaLayout> {
        self.schemas.iter().find(|s| s.name == name)
    }

    /// Agents in declaration order
    pub fn agents(&self) -> &[AgentLayout] {
        &self.agents
    }

    pub fn agent(&self, name: &str) -> Option<&AgentLayout> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// Destinations of the edge (from, schema); empty when there is no edge
    pub fn destinations(&self, from: &Endpoint, schema: &str) -> &[String] {
        self.routes
            .get(&(from.clone(), schema.to_string()))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn routes(&self) -> impl Iterator<Item = RoutingEdge> + '_ {
        self.routes.iter().map(|((from, schema), to)| RoutingEdge {
            from: from.clone(),
            schema: schema.clone(),
            to: to.clone(),
        })
    }

    pub fn handler(&self, agent: &str, schema: &str) -> Option<&HandlerUnit> {
        self.handlers.get(&(agent.to_string(), schema.to_string()))
    }

    /// Handlers of one agent, in schema declaration order
    pub fn agent_handlers<'a>(&'a self, agent: &'a str) -> impl Iterator<Item = (&'a SchemaLayout, &'a HandlerUnit)> + 'a {
        self.schemas
            .iter()
            .filter_map(move |s| self.handler(agent, &s.name).map(|h| (s, h)))
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Total bytes of the state arena
    pub fn state_size(&self) -> u64 {
        self.state_size
    }
}

/// Schema, template, agent and helper names end up inside dotted symbol
/// names (`handler.<agent>.<schema>`), so they must be plain identifiers
fn check_name(kind: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(CompileError::reference(
            format!("{} `{}`", kind, name),
            "names must be identifiers: a letter or `_`, then letters, digits or `_`",
        ));
    }
    Ok(())
}

fn check_literal(entity: String, ty: ValueType, lit: &Literal) -> Result<()> {
    if lit.expr_type() != ty.expr_type() {
        return Err(CompileError::type_error(
            entity,
            format!("expected {}, found {}", ty, lit.expr_type()),
        ));
    }
    if let (ValueType::I32, Literal::Int(v)) = (ty, lit) {
        if i32::try_from(*v).is_err() {
            return Err(CompileError::type_error(
                entity,
                format!("{} does not fit in i32", v),
            ));
        }
    }
    if let Literal::Str(s) = lit {
        if s.as_bytes().contains(&0) {
            return Err(CompileError::type_error(entity, "string contains a NUL byte"));
        }
    }
    Ok(())
}

/// Compute the layout of a program and validate every reference in it
pub fn analyze(model: &ProgramModel, config: &CompileConfig) -> Result<Layout> {
    // Schemas
    let mut schemas = Vec::with_capacity(model.schemas.len());
    for (i, schema) in model.schemas.iter().enumerate() {
        check_name("schema", &schema.name)?;
        if schemas.iter().any(|s: &SchemaLayout| s.name == schema.name) {
            return Err(CompileError::reference(
                format!("schema `{}`", schema.name),
                "schema declared twice",
            ));
        }
        schemas.push(SchemaLayout {
            name: schema.name.clone(),
            id: i as u32 + 1,
            record: RecordLayout::build(&schema.name, &schema.fields)?,
        });
    }
    let schema_names: HashSet<&str> = schemas.iter().map(|s| s.name.as_str()).collect();

    // Templates
    let mut templates = HashMap::new();
    for template in &model.templates {
        check_name("template", &template.name)?;
        if templates.insert(template.name.as_str(), template).is_some() {
            return Err(CompileError::reference(
                format!("template `{}`", template.name),
                "template declared twice",
            ));
        }
        for field in &template.state {
            if let Some(init) = &field.init {
                check_literal(format!("{}.{}", template.name, field.name), field.ty, init)?;
            }
        }
        let mut handled = HashSet::new();
        for handler in &template.handlers {
            if !schema_names.contains(handler.schema.as_str()) {
                return Err(CompileError::reference(
                    format!("handler {}.{}", template.name, handler.schema),
                    "unknown schema",
                ));
            }
            if !handled.insert(handler.schema.as_str()) {
                return Err(CompileError::reference(
                    format!("handler {}.{}", template.name, handler.schema),
                    "two handlers for one schema",
                ));
            }
        }
        let mut helpers = HashSet::new();
        for helper in &template.helpers {
            check_name("helper", &helper.name)?;
            if !helpers.insert(helper.name.as_str()) {
                return Err(CompileError::reference(
                    format!("helper {}.{}", template.name, helper.name),
                    "helper declared twice",
                ));
            }
            if helper.params.len() > MAX_HELPER_PARAMS {
                return Err(CompileError::exhausted(
                    format!("parameters of helper {}.{}", template.name, helper.name),
                    helper.params.len() as u64,
                    MAX_HELPER_PARAMS as u64,
                ));
            }
        }
    }

    // Instances and the state arena
    let mut agents: Vec<AgentLayout> = Vec::with_capacity(model.instances.len());
    let mut cursor = 0u64;
    for instance in &model.instances {
        check_name("agent", &instance.name)?;
        if agents.iter().any(|a| a.name == instance.name) {
            return Err(CompileError::reference(
                format!("agent `{}`", instance.name),
                "agent declared twice",
            ));
        }
        let template = templates.get(instance.template.as_str()).ok_or_else(|| {
            CompileError::reference(
                format!("agent `{}`", instance.name),
                format!("unknown template `{}`", instance.template),
            )
        })?;
        let decls: Vec<FieldDecl> = template
            .state
            .iter()
            .map(|f| FieldDecl {
                name: f.name.clone(),
                ty: f.ty,
            })
            .collect();
        let state = RecordLayout::build(&template.name, &decls)?;
        let base = align_up(cursor, AGENT_ALIGN);
        let size = state.size.max(MIN_AGENT_SIZE);
        cursor = base + size;
        if cursor > config.max_state_bytes {
            return Err(CompileError::exhausted(
                "agent state arena",
                cursor,
                config.max_state_bytes,
            ));
        }
        agents.push(AgentLayout {
            name: instance.name.clone(),
            template: template.name.clone(),
            base,
            size,
            state,
        });
    }
    let agent_names: HashSet<&str> = agents.iter().map(|a| a.name.as_str()).collect();

    // Routing table
    let mut routes: BTreeMap<(Endpoint, String), Vec<String>> = BTreeMap::new();
    for route in &model.routes {
        let edge = format!("edge {} -[{}]->", route.from, route.schema);
        if let Endpoint::Agent(name) = &route.from {
            if !agent_names.contains(name.as_str()) {
                return Err(CompileError::reference(edge, format!("unknown source agent `{}`", name)));
            }
        }
        if !schema_names.contains(route.schema.as_str()) {
            return Err(CompileError::reference(edge, "unknown schema"));
        }
        let dests = routes
            .entry((route.from.clone(), route.schema.clone()))
            .or_default();
        for dest in &route.to {
            if !agent_names.contains(dest.as_str()) {
                return Err(CompileError::reference(
                    format!("{} {}", edge, dest),
                    "unknown destination agent",
                ));
            }
            if dests.contains(dest) {
                return Err(CompileError::reference(
                    format!("{} {}", edge, dest),
                    "destination listed twice",
                ));
            }
            dests.push(dest.clone());
        }
    }

    let receives: HashSet<(&str, &str)> = routes
        .iter()
        .flat_map(|((_, schema), to)| to.iter().map(move |d| (d.as_str(), schema.as_str())))
        .collect();

    // Handler units
    let mut handlers = BTreeMap::new();
    for agent in &agents {
        let template = templates[agent.template.as_str()];
        for handler in &template.handlers {
            if !receives.contains(&(agent.name.as_str(), handler.schema.as_str())) {
                return Err(CompileError::reference(
                    format!("handler {}.{}", agent.name, handler.schema),
                    "no routing edge delivers this schema to the agent",
                ));
            }
            handlers.insert(
                (agent.name.clone(), handler.schema.clone()),
                HandlerUnit {
                    agent: agent.name.clone(),
                    schema: handler.schema.clone(),
                    label: format!("handler.{}.{}", agent.name, handler.schema),
                },
            );
        }
    }
    for ((from, schema), to) in &routes {
        for dest in to {
            if !handlers.contains_key(&(dest.clone(), schema.clone())) {
                return Err(CompileError::reference(
                    format!("edge {} -[{}]-> {}", from, schema, dest),
                    format!("`{}` has no handler for `{}`", dest, schema),
                ));
            }
        }
    }

    // Seed message
    let seed_schema = schemas
        .iter()
        .find(|s| s.name == model.seed.schema)
        .ok_or_else(|| CompileError::reference("seed message", format!("unknown schema `{}`", model.seed.schema)))?;
    for (name, value) in &model.seed.fields {
        let slot = seed_schema.record.field(name).ok_or_else(|| {
            CompileError::reference(format!("seed field `{}`", name), format!("not a field of `{}`", seed_schema.name))
        })?;
        check_literal(format!("seed field `{}`", name), slot.ty, value)?;
    }

    info!(
        schemas = schemas.len(),
        agents = agents.len(),
        routes = routes.len(),
        handlers = handlers.len(),
        state_bytes = cursor,
        "layout complete"
    );
    for agent in &agents {
        debug!(agent = %agent.name, base = agent.base, size = agent.size, "agent region");
    }

    Ok(Layout {
        schemas,
        agents,
        routes,
        handlers,
        state_size: cursor,
    })
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "schemas:")?;
        for schema in &self.schemas {
            writeln!(f, "  #{} {} (size {})", schema.id, schema.name, schema.record.size)?;
            for field in &schema.record.fields {
                writeln!(f, "    +{:<4} {}: {}", field.offset, field.name, field.ty)?;
            }
        }
        writeln!(f, "agents (arena {} bytes):", self.state_size)?;
        for agent in &self.agents {
            writeln!(
                f,
                "  {} : {} @ {:#x} (size {})",
                agent.name, agent.template, agent.base, agent.size
            )?;
            for field in &agent.state.fields {
                writeln!(f, "    +{:<4} {}: {}", field.offset, field.name, field.ty)?;
            }
        }
        writeln!(f, "routes:")?;
        for ((from, schema), to) in &self.routes {
            writeln!(f, "  {} -[{}]-> [{}]", from, schema, to.join(", "))?;
        }
        writeln!(f, "handlers:")?;
        for unit in self.handlers.values() {
            writeln!(f, "  {}", unit.label)?;
        }
        Ok(())
    }
}
