//! Tidal Error System
//!
//! One error enum for the whole pipeline. Every variant names the entity it
//! originated from (routing edge, field, instruction text, symbol, resource)
//! and maps to a stable code so diagnostics can be grepped across builds.
//!
//! | Range | Stage    |
//! |-------|----------|
//! | E1xx  | layout   |
//! | E2xx  | codegen  |
//! | E3xx  | encoding |
//! | E4xx  | link     |
//! | E5xx  | input/io |

use thiserror::Error;

/// Where a resource limit was hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStage {
    /// Configuration or layout sizes (arena, heap, queues)
    Layout,
    /// Per-routine limits (scratch registers, call arguments, frame offsets)
    Codegen,
}

/// Compilation error types
#[derive(Error, Debug)]
pub enum CompileError {
    /// A name (schema, agent, field, local, helper, label, symbol) did not resolve
    #[error("reference error in {entity}: {message}")]
    Reference { entity: String, message: String },

    #[error("type error in {entity}: {message}")]
    Type { entity: String, message: String },

    /// A displacement or immediate exceeds its instruction's field width
    #[error("`{instruction}`: value {value} does not fit in a signed {bits}-bit field")]
    EncodingRange {
        instruction: String,
        value: i64,
        bits: u8,
    },

    #[error("`{instruction}` cannot be encoded: {message}")]
    InvalidInstruction {
        instruction: String,
        message: String,
    },

    #[error("unresolved reference to `{symbol}`")]
    RelocationUnresolved { symbol: String },

    /// A static size exceeds a configured limit
    #[error("{resource}: {requested} exceeds the limit of {limit}")]
    ResourceExhaustion {
        resource: String,
        requested: u64,
        limit: u64,
        stage: LimitStage,
    },

    #[error("invalid program model: {0}")]
    Model(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompileError {
    /// Stable diagnostic code (e.g., "E301")
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::Reference { .. } => "E101",
            CompileError::Type { .. } => "E201",
            CompileError::ResourceExhaustion {
                stage: LimitStage::Codegen,
                ..
            } => "E202",
            CompileError::ResourceExhaustion { .. } => "E102",
            CompileError::EncodingRange { .. } => "E301",
            CompileError::InvalidInstruction { .. } => "E302",
            CompileError::RelocationUnresolved { .. } => "E401",
            CompileError::Model(_) => "E501",
            CompileError::Io(_) => "E502",
        }
    }

    /// Pipeline stage the code belongs to
    pub fn stage(&self) -> &'static str {
        match self.code().as_bytes()[1] {
            b'1' => "layout",
            b'2' => "codegen",
            b'3' => "encoding",
            b'4' => "link",
            _ => "input",
        }
    }

    pub(crate) fn reference(entity: impl Into<String>, message: impl Into<String>) -> Self {
        CompileError::Reference {
            entity: entity.into(),
            message: message.into(),
        }
    }

    pub(crate) fn type_error(entity: impl Into<String>, message: impl Into<String>) -> Self {
        CompileError::Type {
            entity: entity.into(),
            message: message.into(),
        }
    }

    pub(crate) fn exhausted(resource: impl Into<String>, requested: u64, limit: u64) -> Self {
        CompileError::ResourceExhaustion {
            resource: resource.into(),
            requested,
            limit,
            stage: LimitStage::Layout,
        }
    }

    pub(crate) fn codegen_exhausted(resource: impl Into<String>, requested: u64, limit: u64) -> Self {
        CompileError::ResourceExhaustion {
            resource: resource.into(),
            requested,
            limit,
            stage: LimitStage::Codegen,
        }
    }
}

/// Result type for compiler operations
pub type Result<T> = std::result::Result<T, CompileError>;
