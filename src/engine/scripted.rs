//! In-memory engine implementation.
//!
//! Substitutes for the production expression engine everywhere this crate
//! needs to actually run: integration tests and the headless demo renderer.
//! The file-based load stays a real step (`load` reads the materialized
//! kernel from disk and fails the way a real loader would on a missing or
//! foreign file) but compilation is skipped: the context resolves symbols
//! against the fixed kernel signature and `run` calls a deterministic wave
//! function standing in for the opaque spectral sampler.
//!
//! Failure injection (`fail_next_loads`) and symbol hiding
//! (`with_hidden_symbol`) exist so tests can drive the degradation paths:
//! a hidden input behaves like an older program version missing that name,
//! a hidden output makes required-output resolution fail.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::engine::{EngineError, EvalContext, EvalEngine, Handle, Value, ValueKind, ValueRef};
use crate::program::KERNEL_ENTRY;
use crate::shading::Vec3;

/// Gathered inputs for one point, defaults matching the values embedded in
/// the generated kernel signature.
#[derive(Debug, Clone)]
pub struct KernelInputs {
    pub p: Vec3,
    pub eye: Vec3,
    pub incident: Vec3,
    pub dpds: Vec3,
    pub dpdt: Vec3,
    pub normal: Vec3,
    pub geometric_normal: Vec3,
    pub s: f32,
    pub t: f32,
    pub filename: String,
    pub maskname: String,
    pub time: f32,
    pub depthfalloff: i32,
    pub falloff: f32,
    pub downsample: i32,
}

impl Default for KernelInputs {
    fn default() -> Self {
        Self {
            p: Vec3::ZERO,
            eye: Vec3::ZERO,
            incident: Vec3::ZERO,
            dpds: Vec3::ZERO,
            dpdt: Vec3::ZERO,
            normal: Vec3::new(0.0, 1.0, 0.0),
            geometric_normal: Vec3::new(0.0, 1.0, 0.0),
            s: 0.0,
            t: 0.0,
            filename: String::new(),
            maskname: String::new(),
            time: 0.0,
            depthfalloff: 0,
            falloff: 1.0,
            downsample: 0,
        }
    }
}

/// Kernel results for one point.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelOutputs {
    pub displacement: Vec3,
    pub velocity: Vec3,
    pub cusp: f32,
    pub cuspdir: Vec3,
}

pub type KernelFn = dyn Fn(&KernelInputs) -> KernelOutputs + Send + Sync;

/// Deterministic stand-in for the spectral ocean sampler: a couple of
/// crossing sine trains with a choppy horizontal component. Good enough to
/// make heightmaps look like water and to keep tests exact.
pub fn default_wave_kernel(inp: &KernelInputs) -> KernelOutputs {
    let scale = 1.0 / (1u32 << inp.downsample.clamp(0, 8)) as f32;
    let a = (inp.p.x * 0.9 + inp.p.z * 1.3) * scale + inp.time * 1.7;
    let b = (inp.p.x * 2.1 - inp.p.z * 0.7) * scale - inp.time * 2.3;

    let amplitude = match inp.depthfalloff {
        1 => (-inp.falloff).exp(),
        2 => (-inp.falloff * scale).exp(),
        _ => 1.0,
    };

    let height = amplitude * (a.sin() + 0.35 * b.sin());
    let chop = 0.2 * amplitude;
    let displacement = Vec3::new(chop * a.cos(), height, chop * b.cos());
    let cusp = (a.cos() * b.cos()).abs();

    KernelOutputs {
        displacement,
        velocity: Vec3::new(-chop * a.sin(), amplitude * a.cos(), -chop * b.sin()),
        cusp,
        cuspdir: Vec3::new(a.cos(), 0.0, b.cos()),
    }
}

/// Running totals across every context an engine instance has created.
/// All counters are monotonic; tests read deltas around the operation under
/// scrutiny.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub contexts_built: AtomicUsize,
    pub loads_attempted: AtomicUsize,
    pub loads_succeeded: AtomicUsize,
    pub runs: AtomicUsize,
    pub sets: AtomicUsize,
    pub uniform_sets: AtomicUsize,
}

impl EngineStats {
    pub fn contexts_built(&self) -> usize {
        self.contexts_built.load(Ordering::SeqCst)
    }
    pub fn loads_attempted(&self) -> usize {
        self.loads_attempted.load(Ordering::SeqCst)
    }
    pub fn loads_succeeded(&self) -> usize {
        self.loads_succeeded.load(Ordering::SeqCst)
    }
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }
    pub fn uniform_sets(&self) -> usize {
        self.uniform_sets.load(Ordering::SeqCst)
    }
}

/// In-memory engine. Cloning is cheap and shares stats, failure injection
/// and the kernel function with the original.
#[derive(Clone)]
pub struct ScriptedEngine {
    stats: Arc<EngineStats>,
    hidden: HashSet<String>,
    fail_loads: Arc<AtomicUsize>,
    kernel: Arc<KernelFn>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(EngineStats::default()),
            hidden: HashSet::new(),
            fail_loads: Arc::new(AtomicUsize::new(0)),
            kernel: Arc::new(default_wave_kernel),
        }
    }

    /// Pretend the loaded program does not declare `name` (input or output).
    pub fn with_hidden_symbol(mut self, name: impl Into<String>) -> Self {
        self.hidden.insert(name.into());
        self
    }

    /// Replace the built-in wave kernel.
    pub fn with_kernel(
        mut self,
        kernel: impl Fn(&KernelInputs) -> KernelOutputs + Send + Sync + 'static,
    ) -> Self {
        self.kernel = Arc::new(kernel);
        self
    }

    /// Make the next `n` load attempts fail with an injected error.
    pub fn fail_next_loads(&self, n: usize) {
        self.fail_loads.store(n, Ordering::SeqCst);
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EvalEngine for ScriptedEngine {
    type Context = ScriptedContext;

    fn create_context(&self) -> ScriptedContext {
        self.stats.contexts_built.fetch_add(1, Ordering::SeqCst);
        ScriptedContext {
            stats: Arc::clone(&self.stats),
            hidden: self.hidden.clone(),
            fail_loads: Arc::clone(&self.fail_loads),
            kernel: Arc::clone(&self.kernel),
            declared: Vec::new(),
            symbols: Vec::new(),
            loaded: false,
            inputs: HashMap::new(),
            armed_outputs: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Declared {
    name: String,
    kind: ValueKind,
    varying: bool,
}

#[derive(Debug, Clone)]
struct Symbol {
    name: String,
    kind: ValueKind,
    varying: bool,
    is_output: bool,
}

/// Exported outputs of the fixed kernel signature.
const KERNEL_OUTPUTS: [(&str, ValueKind); 4] = [
    ("displacement", ValueKind::Vector3),
    ("velocity", ValueKind::Vector3),
    ("cusp", ValueKind::Float),
    ("cuspdir", ValueKind::Vector3),
];

pub struct ScriptedContext {
    stats: Arc<EngineStats>,
    hidden: HashSet<String>,
    fail_loads: Arc<AtomicUsize>,
    kernel: Arc<KernelFn>,

    declared: Vec<Declared>,
    // Resolved at load: declared inputs present in the program, then outputs.
    symbols: Vec<Symbol>,
    loaded: bool,

    // Set values keyed by symbol name; outputs are "armed" by a set through
    // their handle and only armed outputs are produced by `run`.
    inputs: HashMap<String, Value>,
    armed_outputs: HashMap<String, Value>,
}

impl ScriptedContext {
    fn symbol(&self, handle: Handle) -> Option<&Symbol> {
        self.symbols.get(handle.0 as usize)
    }

    fn find(&self, name: &str, kind: ValueKind, output: bool) -> Option<Handle> {
        if !self.loaded {
            return None;
        }
        self.symbols
            .iter()
            .position(|s| s.name == name && s.kind == kind && s.is_output == output)
            .map(|i| Handle(i as u32))
    }

    fn input_or_default(&self, defaults: &KernelInputs, index: usize, name: &str) -> Value {
        // Varying inputs index per point, uniforms always read slot 0.
        let varying = self
            .symbols
            .iter()
            .find(|s| s.name == name && !s.is_output)
            .map(|s| s.varying)
            .unwrap_or(false);
        let at = if varying { index } else { 0 };

        match self.inputs.get(name) {
            Some(Value::Float(v)) if v.len() > at => Value::Float(vec![v[at]]),
            Some(Value::Int(v)) if v.len() > at => Value::Int(vec![v[at]]),
            Some(Value::Vector3(v)) if v.len() > at => Value::Vector3(vec![v[at]]),
            Some(Value::String(v)) if v.len() > at => Value::String(vec![v[at].clone()]),
            _ => match name {
                "P" => Value::Vector3(vec![defaults.p]),
                "Eye" => Value::Vector3(vec![defaults.eye]),
                "I" => Value::Vector3(vec![defaults.incident]),
                "dPds" => Value::Vector3(vec![defaults.dpds]),
                "dPdt" => Value::Vector3(vec![defaults.dpdt]),
                "N" => Value::Vector3(vec![defaults.normal]),
                "Ng" => Value::Vector3(vec![defaults.geometric_normal]),
                "s" => Value::Float(vec![defaults.s]),
                "t" => Value::Float(vec![defaults.t]),
                "filename" => Value::String(vec![defaults.filename.clone()]),
                "maskname" => Value::String(vec![defaults.maskname.clone()]),
                "time" => Value::Float(vec![defaults.time]),
                "depthfalloff" => Value::Int(vec![defaults.depthfalloff]),
                "falloff" => Value::Float(vec![defaults.falloff]),
                "downsample" => Value::Int(vec![defaults.downsample]),
                _ => Value::Float(vec![0.0]),
            },
        }
    }

    fn gather_point(&self, index: usize) -> KernelInputs {
        let defaults = KernelInputs::default();
        let vec3 = |name: &str| {
            self.input_or_default(&defaults, index, name)
                .first_vector3()
                .unwrap_or(Vec3::ZERO)
        };
        let flt = |name: &str| {
            self.input_or_default(&defaults, index, name)
                .first_float()
                .unwrap_or(0.0)
        };
        let int = |name: &str| match self.input_or_default(&defaults, index, name) {
            Value::Int(v) => v.first().copied().unwrap_or(0),
            _ => 0,
        };
        let string = |name: &str| match self.input_or_default(&defaults, index, name) {
            Value::String(v) => v.first().cloned().unwrap_or_default(),
            _ => String::new(),
        };

        KernelInputs {
            p: vec3("P"),
            eye: vec3("Eye"),
            incident: vec3("I"),
            dpds: vec3("dPds"),
            dpdt: vec3("dPdt"),
            normal: vec3("N"),
            geometric_normal: vec3("Ng"),
            s: flt("s"),
            t: flt("t"),
            filename: string("filename"),
            maskname: string("maskname"),
            time: flt("time"),
            depthfalloff: int("depthfalloff"),
            falloff: flt("falloff"),
            downsample: int("downsample"),
        }
    }
}

impl EvalContext for ScriptedContext {
    fn declare_input(&mut self, name: &str, kind: ValueKind, varying: bool) {
        self.declared.push(Declared {
            name: name.to_string(),
            kind,
            varying,
        });
    }

    fn load(&mut self, argv: &[String]) -> Result<(), EngineError> {
        self.stats.loads_attempted.fetch_add(1, Ordering::SeqCst);

        let Some(path) = argv.first() else {
            return Err(EngineError::Load("empty loader command".to_string()));
        };

        // Injected failures come first so tests can exercise the retry path
        // without touching the filesystem.
        let mut pending = self.fail_loads.load(Ordering::SeqCst);
        while pending > 0 {
            match self.fail_loads.compare_exchange(
                pending,
                pending - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Err(EngineError::Load(format!(
                        "injected load failure for {path}"
                    )));
                }
                Err(current) => pending = current,
            }
        }

        let source = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Load(format!("cannot read program {path}: {e}")))?;
        if !source.contains(KERNEL_ENTRY) {
            return Err(EngineError::Load(format!(
                "no '{KERNEL_ENTRY}' entry in {path}"
            )));
        }

        // Resolve the declared inputs against the program text; a declared
        // name the program doesn't mention simply never becomes a symbol.
        self.symbols.clear();
        for d in &self.declared {
            if self.hidden.contains(&d.name) || !source.contains(d.name.as_str()) {
                continue;
            }
            self.symbols.push(Symbol {
                name: d.name.clone(),
                kind: d.kind,
                varying: d.varying,
                is_output: false,
            });
        }
        for (name, kind) in KERNEL_OUTPUTS {
            if self.hidden.contains(name) {
                continue;
            }
            self.symbols.push(Symbol {
                name: name.to_string(),
                kind,
                varying: true,
                is_output: true,
            });
        }

        self.loaded = true;
        self.stats.loads_succeeded.fetch_add(1, Ordering::SeqCst);
        log::debug!("scripted engine loaded {path}");
        Ok(())
    }

    fn find_input(&self, name: &str, kind: ValueKind) -> Option<Handle> {
        self.find(name, kind, false)
    }

    fn find_output(&self, name: &str, kind: ValueKind) -> Option<Handle> {
        self.find(name, kind, true)
    }

    fn set(&mut self, handle: Handle, value: ValueRef<'_>) -> Result<(), EngineError> {
        let Some(sym) = self.symbol(handle).cloned() else {
            return Err(EngineError::Value(format!(
                "unknown handle {}",
                handle.0
            )));
        };
        if sym.kind != value.kind() {
            return Err(EngineError::Value(format!(
                "kind mismatch for '{}': expected {:?}, got {:?}",
                sym.name,
                sym.kind,
                value.kind()
            )));
        }

        let owned = match value {
            ValueRef::Float(v) => Value::Float(v.to_vec()),
            ValueRef::Int(v) => Value::Int(v.to_vec()),
            ValueRef::Vector3(v) => Value::Vector3(v.to_vec()),
            ValueRef::String(v) => Value::String(v.to_vec()),
        };

        self.stats.sets.fetch_add(1, Ordering::SeqCst);
        if sym.is_output {
            // Arming: the caller provides the initial output buffer that a
            // run overwrites. Unarmed outputs are discarded by `run`.
            self.armed_outputs.insert(sym.name, owned);
        } else {
            if !sym.varying {
                self.stats.uniform_sets.fetch_add(1, Ordering::SeqCst);
            }
            self.inputs.insert(sym.name, owned);
        }
        Ok(())
    }

    fn run(&mut self, npoints: usize) -> Result<(), EngineError> {
        if !self.loaded {
            return Err(EngineError::Run("no program loaded".to_string()));
        }
        self.stats.runs.fetch_add(1, Ordering::SeqCst);

        let mut displacement = Vec::with_capacity(npoints);
        let mut velocity = Vec::with_capacity(npoints);
        let mut cusp = Vec::with_capacity(npoints);
        let mut cuspdir = Vec::with_capacity(npoints);
        for i in 0..npoints {
            let out = (self.kernel)(&self.gather_point(i));
            displacement.push(out.displacement);
            velocity.push(out.velocity);
            cusp.push(out.cusp);
            cuspdir.push(out.cuspdir);
        }

        for (name, value) in [
            ("displacement", Value::Vector3(displacement)),
            ("velocity", Value::Vector3(velocity)),
            ("cusp", Value::Float(cusp)),
            ("cuspdir", Value::Vector3(cuspdir)),
        ] {
            if let Some(slot) = self.armed_outputs.get_mut(name) {
                *slot = value;
            }
        }
        Ok(())
    }

    fn output(&self, handle: Handle) -> Option<Value> {
        let sym = self.symbol(handle)?;
        if !sym.is_output {
            return None;
        }
        self.armed_outputs.get(&sym.name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{TempNameAllocator, materialize};

    fn loaded_context(engine: &ScriptedEngine) -> ScriptedContext {
        let mut ctx = engine.create_context();
        ctx.declare_input("P", ValueKind::Vector3, true);
        ctx.declare_input("time", ValueKind::Float, false);
        let path = materialize(&mut TempNameAllocator::new()).unwrap();
        ctx.load(&[path.display().to_string()]).unwrap();
        ctx
    }

    #[test]
    fn load_requires_readable_program_file() {
        let engine = ScriptedEngine::new();
        let mut ctx = engine.create_context();
        let err = ctx
            .load(&["/nonexistent/kernel.vfl".to_string()])
            .unwrap_err();
        assert!(matches!(err, EngineError::Load(_)));
    }

    #[test]
    fn injected_load_failure_then_recovery() {
        let engine = ScriptedEngine::new();
        engine.fail_next_loads(1);

        let path = materialize(&mut TempNameAllocator::new()).unwrap();
        let argv = vec![path.display().to_string()];

        let mut ctx = engine.create_context();
        ctx.declare_input("P", ValueKind::Vector3, true);
        assert!(ctx.load(&argv).is_err());
        // The failure budget is consumed; the retry succeeds.
        assert!(ctx.load(&argv).is_ok());
    }

    #[test]
    fn hidden_symbols_do_not_resolve() {
        let engine = ScriptedEngine::new().with_hidden_symbol("time");
        let ctx = loaded_context(&engine);
        assert!(ctx.find_input("P", ValueKind::Vector3).is_some());
        assert!(ctx.find_input("time", ValueKind::Float).is_none());
    }

    #[test]
    fn kind_mismatch_does_not_resolve() {
        let engine = ScriptedEngine::new();
        let ctx = loaded_context(&engine);
        assert!(ctx.find_input("P", ValueKind::Float).is_none());
        assert!(ctx.find_output("cusp", ValueKind::Vector3).is_none());
    }

    #[test]
    fn run_writes_only_armed_outputs() {
        let engine = ScriptedEngine::new();
        let mut ctx = loaded_context(&engine);

        let p = ctx.find_input("P", ValueKind::Vector3).unwrap();
        ctx.set(p, ValueRef::Vector3(&[Vec3::new(1.0, 2.0, 3.0)]))
            .unwrap();

        let disp = ctx.find_output("displacement", ValueKind::Vector3).unwrap();
        let cusp = ctx.find_output("cusp", ValueKind::Float).unwrap();
        ctx.set(disp, ValueRef::Vector3(&[Vec3::ZERO])).unwrap();
        ctx.run(1).unwrap();

        assert!(ctx.output(disp).unwrap().first_vector3().is_some());
        // cusp was never armed, so the run produced nothing for it.
        assert!(ctx.output(cusp).is_none());
    }

    #[test]
    fn default_wave_kernel_is_deterministic() {
        let inp = KernelInputs {
            p: Vec3::new(1.0, 0.0, 2.0),
            time: 2.5,
            ..KernelInputs::default()
        };
        let a = default_wave_kernel(&inp);
        let b = default_wave_kernel(&inp);
        assert_eq!(a.displacement, b.displacement);
        assert_eq!(a.cusp, b.cusp);
    }
}
