//! Evaluation-engine capability boundary.
//!
//! The expression engine that actually compiles and runs the ocean kernel is
//! a black box to this crate: a stateful context that is expensive to build
//! (declare inputs, load a program from a file, resolve symbols) and cheap to
//! invoke. This module pins down that contract as traits so a production
//! engine binding and the in-memory [`scripted`] engine are interchangeable:
//! - `declare` named, typed inputs with a varying/uniform flag;
//! - `load` a program from a tokenized command line built from a file path;
//! - `resolve` names to opaque [`Handle`]s (absent on unknown name or kind
//!   mismatch, never an error);
//! - `set` values by handle, `run` synchronously, read outputs back.

pub mod scripted;

use thiserror::Error;

use crate::shading::Vec3;

/// Failure surfaced by an engine context. `Load` carries the engine's own
/// error string (the equivalent of a last-error query on the raw API).
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("program load failed: {0}")]
    Load(String),
    #[error("kernel execution failed: {0}")]
    Run(String),
    #[error("invalid value for bound symbol: {0}")]
    Value(String),
}

/// Type tag for a declared input or output slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Float,
    Int,
    Vector3,
    String,
}

/// Opaque reference to a named, typed slot inside one context instance.
///
/// Valid only for the context that produced it; dangling once that context
/// is destroyed. Callers cache handles for the context's lifetime and must
/// drop them with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(pub(crate) u32);

/// Borrowed, typed value buffer pushed into a context. The context copies;
/// it never retains the borrow.
#[derive(Debug, Clone, Copy)]
pub enum ValueRef<'a> {
    Float(&'a [f32]),
    Int(&'a [i32]),
    Vector3(&'a [Vec3]),
    String(&'a [String]),
}

impl ValueRef<'_> {
    pub fn kind(&self) -> ValueKind {
        match self {
            ValueRef::Float(_) => ValueKind::Float,
            ValueRef::Int(_) => ValueKind::Int,
            ValueRef::Vector3(_) => ValueKind::Vector3,
            ValueRef::String(_) => ValueKind::String,
        }
    }
}

/// Owned, typed value buffer read back from a context after a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(Vec<f32>),
    Int(Vec<i32>),
    Vector3(Vec<Vec3>),
    String(Vec<String>),
}

impl Value {
    /// First element of a vector buffer, for single-point reads.
    pub fn first_vector3(&self) -> Option<Vec3> {
        match self {
            Value::Vector3(v) => v.first().copied(),
            _ => None,
        }
    }

    /// First element of a float buffer, for single-point reads.
    pub fn first_float(&self) -> Option<f32> {
        match self {
            Value::Float(v) => v.first().copied(),
            _ => None,
        }
    }
}

/// One stateful evaluation context. Non-copyable, exclusively owned by a
/// single worker-thread slot once built.
pub trait EvalContext {
    /// Declare a named input ahead of `load`. `varying` inputs take one
    /// value per evaluated point; uniform inputs take one value total.
    fn declare_input(&mut self, name: &str, kind: ValueKind, varying: bool);

    /// Load the program named by `argv` (tokenized command form; `argv[0]`
    /// is the program file path). On failure the context stays unusable and
    /// the error carries the engine's diagnostic string.
    fn load(&mut self, argv: &[String]) -> Result<(), EngineError>;

    /// Resolve a declared input by name and kind. Absent names or kind
    /// mismatches yield `None`, not an error.
    fn find_input(&self, name: &str, kind: ValueKind) -> Option<Handle>;

    /// Resolve a program output by name and kind.
    fn find_output(&self, name: &str, kind: ValueKind) -> Option<Handle>;

    /// Push a value buffer for an input handle. The context copies the data.
    fn set(&mut self, handle: Handle, value: ValueRef<'_>) -> Result<(), EngineError>;

    /// Execute the loaded program synchronously for `npoints` points.
    fn run(&mut self, npoints: usize) -> Result<(), EngineError>;

    /// Read an output buffer back after a run.
    fn output(&self, handle: Handle) -> Option<Value>;
}

/// Context factory. Shared by reference across all worker threads, so it
/// must be `Sync`; the contexts it creates move into per-thread slots.
pub trait EvalEngine: Send + Sync {
    type Context: EvalContext + Send;

    fn create_context(&self) -> Self::Context;
}

/// Split a command line into loader arguments. The engine's loader takes a
/// tokenized argument list rather than a bare path, so the path goes through
/// the same tokenization a script invocation would.
pub fn tokenize_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}
