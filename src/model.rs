//! Program Model
//!
//! The analyzed agent program handed over by the front end: message schemas,
//! agent templates and instances, static routing edges and the seed message.
//! Deserialized from JSON; expression and statement trees are tagged by
//! `"kind"`.
//!
//! ```json
//! {
//!   "schemas":   [{"name": "Ping", "fields": [{"name": "n", "type": "i64"}]}],
//!   "templates": [{"name": "Echo", "state": [], "handlers": [
//!       {"schema": "Ping", "body": [{"kind": "write", "value": {"kind": "field", "field": "n"}}]}]}],
//!   "instances": [{"name": "echo", "template": "Echo"}],
//!   "routes":    [{"from": "external", "schema": "Ping", "to": ["echo"]}],
//!   "seed":      {"schema": "Ping", "fields": {"n": 7}}
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Storage type of a schema field, state field or helper parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Bool,
    I32,
    I64,
    /// Pointer to NUL-terminated bytes
    Str,
}

impl ValueType {
    pub fn size(self) -> u64 {
        match self {
            ValueType::Bool => 1,
            ValueType::I32 => 4,
            ValueType::I64 | ValueType::Str => 8,
        }
    }

    pub fn align(self) -> u64 {
        self.size()
    }

    pub fn expr_type(self) -> ExprType {
        match self {
            ValueType::Bool => ExprType::Bool,
            ValueType::I32 | ValueType::I64 => ExprType::Int,
            ValueType::Str => ExprType::Str,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Bool => "bool",
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::Str => "str",
        };
        f.write_str(name)
    }
}

/// Type of a value held in a register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExprType {
    Int,
    Bool,
    Str,
}

impl fmt::Display for ExprType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExprType::Int => "int",
            ExprType::Bool => "bool",
            ExprType::Str => "str",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ValueType,
}

/// Named, fixed-layout message type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSchema {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDecl>,
}

/// Constant value in state initializers and the seed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Literal {
    pub fn expr_type(&self) -> ExprType {
        match self {
            Literal::Bool(_) => ExprType::Bool,
            Literal::Int(_) => ExprType::Int,
            Literal::Str(_) => ExprType::Str,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ValueType,
    /// Zero (or the empty string) when absent
    #[serde(default)]
    pub init: Option<Literal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    pub schema: String,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

/// Routine callable from the handlers of the same agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Helper {
    pub name: String,
    #[serde(default)]
    pub params: Vec<FieldDecl>,
    #[serde(default)]
    pub returns: Option<ValueType>,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTemplate {
    pub name: String,
    #[serde(default)]
    pub state: Vec<StateField>,
    #[serde(default)]
    pub handlers: Vec<Handler>,
    #[serde(default)]
    pub helpers: Vec<Helper>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInstance {
    pub name: String,
    pub template: String,
}

/// Source side of a routing edge
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// The outside world (the seed message)
    External,
    Agent(String),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::External => f.write_str("external"),
            Endpoint::Agent(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub from: Endpoint,
    pub schema: String,
    pub to: Vec<String>,
}

/// The one message injected before the first cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed {
    pub schema: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Literal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOperator {
    /// Arithmetic negation
    Neg,
    /// Logical negation
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Logical and (both operands evaluated)
    Land,
    /// Logical or (both operands evaluated)
    Lor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Builtin {
    /// `len(s) -> int`
    Len,
    /// `concat(a, b) -> str`
    Concat,
    /// `format(n) -> str`, decimal
    Format,
    /// `repeat(s, n) -> str`
    Repeat,
    /// `read_input([max]) -> str`, one read from stdin
    ReadInput,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Len => "len",
            Builtin::Concat => "concat",
            Builtin::Format => "format",
            Builtin::Repeat => "repeat",
            Builtin::ReadInput => "read_input",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Int {
        value: i64,
    },
    Bool {
        value: bool,
    },
    Str {
        value: String,
    },
    /// Read a field of the current agent's state
    State {
        field: String,
    },
    /// Read a field of the inbound message
    Field {
        field: String,
    },
    /// Read a local variable or helper parameter
    Local {
        name: String,
    },
    Unary {
        op: UnaryOperator,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOperator,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Builtin {
        name: Builtin,
        #[serde(default)]
        args: Vec<Expr>,
    },
    /// Call a helper of the current agent
    Call {
        helper: String,
        #[serde(default)]
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssignTarget {
    State { field: String },
    Local { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Stmt {
    Let {
        name: String,
        value: Expr,
    },
    Assign {
        target: AssignTarget,
        value: Expr,
    },
    /// Send a message along the static edge (current agent, schema)
    Emit {
        schema: String,
        #[serde(default)]
        fields: BTreeMap<String, Expr>,
    },
    If {
        cond: Expr,
        #[serde(default)]
        then: Vec<Stmt>,
        #[serde(default, rename = "else")]
        otherwise: Vec<Stmt>,
    },
    While {
        cond: Expr,
        #[serde(default)]
        body: Vec<Stmt>,
    },
    Block {
        #[serde(default)]
        body: Vec<Stmt>,
    },
    /// Program output on stdout
    Write {
        value: Expr,
    },
    /// Debug output on stderr, compiled only with `debug_reports`
    Report {
        value: Expr,
    },
    Return {
        #[serde(default)]
        value: Option<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramModel {
    #[serde(default)]
    pub schemas: Vec<MessageSchema>,
    #[serde(default)]
    pub templates: Vec<AgentTemplate>,
    #[serde(default)]
    pub instances: Vec<AgentInstance>,
    #[serde(default)]
    pub routes: Vec<Route>,
    pub seed: Seed,
}

impl ProgramModel {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn template(&self, name: &str) -> Option<&AgentTemplate> {
        self.templates.iter().find(|t| t.name == name)
    }

    pub fn schema(&self, name: &str) -> Option<&MessageSchema> {
        self.schemas.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_layout() {
        assert_eq!(ValueType::Bool.size(), 1);
        assert_eq!(ValueType::I32.align(), 4);
        assert_eq!(ValueType::Str.size(), 8);
        assert_eq!(ValueType::I32.expr_type(), ExprType::Int);
    }

    #[test]
    fn test_parse_program() {
        let json = r#"{
            "schemas": [{"name": "Ping", "fields": [{"name": "n", "type": "i64"}]}],
            "templates": [{
                "name": "Echo",
                "state": [{"name": "seen", "type": "i32", "init": 0}],
                "handlers": [{"schema": "Ping", "body": [
                    {"kind": "assign", "target": {"kind": "state", "field": "seen"},
                     "value": {"kind": "binary", "op": "add",
                               "lhs": {"kind": "state", "field": "seen"},
                               "rhs": {"kind": "int", "value": 1}}},
                    {"kind": "if", "cond": {"kind": "bool", "value": true},
                     "then": [{"kind": "write", "value": {"kind": "field", "field": "n"}}]}
                ]}]
            }],
            "instances": [{"name": "echo", "template": "Echo"}],
            "routes": [
                {"from": "external", "schema": "Ping", "to": ["echo"]},
                {"from": {"agent": "echo"}, "schema": "Ping", "to": []}
            ],
            "seed": {"schema": "Ping", "fields": {"n": 7}}
        }"#;
        let model = ProgramModel::from_json(json).unwrap();
        assert_eq!(model.routes[0].from, Endpoint::External);
        assert_eq!(model.routes[1].from, Endpoint::Agent("echo".to_string()));
        assert_eq!(model.seed.fields["n"], Literal::Int(7));
        let handler = &model.templates[0].handlers[0];
        match &handler.body[1] {
            Stmt::If { then, otherwise, .. } => {
                assert_eq!(then.len(), 1);
                assert!(otherwise.is_empty());
            }
            other => panic!("unexpected statement {other:?}"),
        }
    }

    #[test]
    fn test_literals_are_untagged() {
        let lits: Vec<Literal> = serde_json::from_str(r#"[true, -3, "hi"]"#).unwrap();
        assert_eq!(
            lits,
            vec![
                Literal::Bool(true),
                Literal::Int(-3),
                Literal::Str("hi".to_string())
            ]
        );
    }

    #[test]
    fn test_unknown_kind_is_a_model_error() {
        let err = serde_json::from_str::<Expr>(r#"{"kind": "lambda"}"#);
        assert!(err.is_err());
    }
}
