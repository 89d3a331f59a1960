//! Procedural ocean-surface displacement node.
//!
//! Evaluates an ocean displacement field inside a renderer's per-point
//! shading callback by marshalling each shading sample into an embedded
//! expression-evaluation engine running a fixed kernel. The engine is a
//! black box behind the [`engine`] traits; the crate's own substance is the
//! plumbing around it:
//! - lazy, once-per-worker-thread context construction (temp kernel file,
//!   load, uniform binding) that stays correct under concurrent first use;
//! - lock-free, allocation-light steady-state marshalling of varying
//!   shading inputs and displacement/cusp outputs;
//! - the rest-position fallback that compensates for displacement already
//!   baked into incoming point positions.
//!
//! Entry points: [`node::OceanNode`] with [`params::OceanParams`], plus
//! [`engine::scripted::ScriptedEngine`] as the in-memory engine used by the
//! tests and the headless demo renderer.

pub mod engine;
pub mod node;
pub mod params;
pub mod program;
pub mod shading;

pub use engine::{EngineError, EvalContext, EvalEngine, Handle, Value, ValueKind, ValueRef};
pub use node::{MAX_RENDER_THREADS, OceanNode};
pub use params::{DepthFalloff, OceanParams};
pub use shading::{Rgba, ShadingPoint, Vec3};
