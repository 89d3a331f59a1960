//! Renderer-boundary data types: the per-point shading state the renderer
//! hands to the node, and the small vector/color values flowing through it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Plain 3-component vector. Fields match the renderer's float precision.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

impl std::ops::Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl std::ops::Add for Vec3 {
    type Output = Vec3;
    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

/// Shading output slot. RGB carries the displacement vector, A the cusp
/// scalar. `ZERO` is the production default: a point that fails to evaluate
/// renders undisplaced.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rgba {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Rgba {
    pub const ZERO: Rgba = Rgba {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 0.0,
    };

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn from_displacement(d: Vec3, cusp: f32) -> Self {
        Self::new(d.x, d.y, d.z, cusp)
    }
}

/// Per-point shading state, the subset of the renderer's shading globals the
/// ocean kernel consumes. All fields are varying; `thread_index` identifies
/// the worker slot the renderer scheduled this sample on.
#[derive(Debug, Clone)]
pub struct ShadingPoint {
    pub position: Vec3,
    pub eye: Vec3,
    pub incident: Vec3,
    pub dpds: Vec3,
    pub dpdt: Vec3,
    pub normal: Vec3,
    pub geometric_normal: Vec3,
    pub s: f32,
    pub t: f32,
    pub thread_index: usize,

    /// Named per-point user attributes (rest position lives here when the
    /// geometry carries one). Availability can differ point to point.
    attributes: HashMap<String, Vec3>,
}

impl ShadingPoint {
    /// A point at `position` with a degenerate frame, for callers that only
    /// care about position-driven displacement (tests, the demo renderer).
    pub fn at(position: Vec3, thread_index: usize) -> Self {
        Self {
            position,
            eye: Vec3::ZERO,
            incident: Vec3::new(0.0, -1.0, 0.0),
            dpds: Vec3::new(1.0, 0.0, 0.0),
            dpdt: Vec3::new(0.0, 0.0, 1.0),
            normal: Vec3::new(0.0, 1.0, 0.0),
            geometric_normal: Vec3::new(0.0, 1.0, 0.0),
            s: 0.0,
            t: 0.0,
            thread_index,
            attributes: HashMap::new(),
        }
    }

    /// Attach a named vector attribute (builder-style).
    pub fn with_attribute(mut self, name: impl Into<String>, value: Vec3) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Named-attribute lookup used by the rest-position fallback. Returns
    /// `None` when the geometry does not carry the attribute at this point.
    pub fn attribute(&self, name: &str) -> Option<Vec3> {
        self.attributes.get(name).copied()
    }
}
