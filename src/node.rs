//! The ocean displacement node: per-thread evaluation-context pool, lazy
//! context construction, per-call marshalling and the rest-position
//! fallback.
//!
//! Concurrency protocol: the renderer calls [`OceanNode::evaluate`]
//! concurrently from a bounded pool of worker threads, each invocation
//! tagged with its worker's thread index. A slot is only ever touched by
//! the thread owning that index, so the steady-state path takes no lock;
//! each slot carries a single atomic claim flag that asserts the protocol
//! and releases on the way out. Reconfiguration takes `&mut self`, which
//! makes "no evaluation in flight" a compile-time fact rather than a
//! runtime hope.

use std::cell::UnsafeCell;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context as _, Result, anyhow};

use crate::engine::{EvalContext, EvalEngine, Handle, ValueKind, ValueRef, tokenize_command};
use crate::params::OceanParams;
use crate::program::{self, TempNameAllocator};
use crate::shading::{Rgba, ShadingPoint, Vec3};

/// Upper bound on renderer worker threads; sizes the slot pool.
pub const MAX_RENDER_THREADS: usize = 256;

// ---------------------------------------------------------------------------
// Binding table
// ---------------------------------------------------------------------------

/// Handles resolved once per context lifetime and reused by every call on
/// that thread. Absent entries mean the loaded program does not declare the
/// name (or declares it with another type); setting through an absent entry
/// is a no-op, and absent required outputs skip execution entirely.
struct Bindings {
    p: Option<Handle>,
    eye: Option<Handle>,
    incident: Option<Handle>,
    dpds: Option<Handle>,
    dpdt: Option<Handle>,
    normal: Option<Handle>,
    geometric_normal: Option<Handle>,
    s: Option<Handle>,
    t: Option<Handle>,
    // Required outputs. Velocity and cusp direction are declared by the
    // kernel but never consumed here.
    out_displacement: Option<Handle>,
    out_cusp: Option<Handle>,
}

impl Bindings {
    fn resolve<C: EvalContext>(ctx: &C) -> Self {
        Self {
            p: ctx.find_input("P", ValueKind::Vector3),
            eye: ctx.find_input("Eye", ValueKind::Vector3),
            incident: ctx.find_input("I", ValueKind::Vector3),
            dpds: ctx.find_input("dPds", ValueKind::Vector3),
            dpdt: ctx.find_input("dPdt", ValueKind::Vector3),
            normal: ctx.find_input("N", ValueKind::Vector3),
            geometric_normal: ctx.find_input("Ng", ValueKind::Vector3),
            s: ctx.find_input("s", ValueKind::Float),
            t: ctx.find_input("t", ValueKind::Float),
            out_displacement: ctx.find_output("displacement", ValueKind::Vector3),
            out_cusp: ctx.find_output("cusp", ValueKind::Float),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-thread slots
// ---------------------------------------------------------------------------

/// Per-thread persistent uniform values, one named field per uniform
/// parameter so no two parameters (or threads) ever share a slot. Written
/// once per context build and re-fed to the context from here, keeping the
/// bind source alive for the context's whole lifetime.
#[derive(Debug, Default)]
struct UniformScratch {
    time: [f32; 1],
    falloff: [f32; 1],
    depth_falloff: [i32; 1],
    downsample: [i32; 1],
    spectrum: Vec<String>,
    mask: Vec<String>,
}

struct BoundContext<C> {
    ctx: C,
    bind: Bindings,
}

struct SlotState<C> {
    ctx: Option<BoundContext<C>>,
    uniforms: UniformScratch,
}

struct ThreadSlot<C> {
    /// Asserts the single-owner protocol on the `&self` evaluation path.
    claimed: AtomicBool,
    state: UnsafeCell<SlotState<C>>,
}

// The cell is only reached through a successful claim (exclusive by the
// swap in `try_claim`) or through `&mut self` invalidation.
unsafe impl<C: Send> Sync for ThreadSlot<C> {}

impl<C> ThreadSlot<C> {
    fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            state: UnsafeCell::new(SlotState {
                ctx: None,
                uniforms: UniformScratch::default(),
            }),
        }
    }

    fn try_claim(&self) -> Option<SlotClaim<'_, C>> {
        if self.claimed.swap(true, Ordering::Acquire) {
            return None;
        }
        Some(SlotClaim { slot: self })
    }
}

/// Exclusive access to one slot's state for the duration of a call.
struct SlotClaim<'a, C> {
    slot: &'a ThreadSlot<C>,
}

impl<C> SlotClaim<'_, C> {
    fn state(&mut self) -> &mut SlotState<C> {
        // Safety: the claim flag was won by swap in `try_claim` and is held
        // until drop, so no other reference to this state exists.
        unsafe { &mut *self.slot.state.get() }
    }
}

impl<C> Drop for SlotClaim<'_, C> {
    fn drop(&mut self) {
        self.slot.claimed.store(false, Ordering::Release);
    }
}

struct SlotPool<C> {
    slots: Box<[ThreadSlot<C>]>,
}

impl<C> SlotPool<C> {
    fn new() -> Self {
        let slots: Vec<ThreadSlot<C>> = (0..MAX_RENDER_THREADS).map(|_| ThreadSlot::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    fn slot(&self, thread_index: usize) -> Option<&ThreadSlot<C>> {
        self.slots.get(thread_index)
    }

    /// Destroy every context and reset every slot to empty. Requires `&mut`,
    /// so the caller proves no evaluation is in flight.
    fn invalidate_all(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot.claimed.get_mut() = false;
            slot.state.get_mut().ctx = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Kernel-file materialization state, guarded by the node's lock. The lock
/// scope is exactly filename allocation + file write; widening it would
/// serialize first-use across worker threads for no benefit.
struct Materializer {
    alloc: TempNameAllocator,
    last_program: Option<PathBuf>,
}

/// One shader-node instance.
///
/// Lifecycle: [`OceanNode::new`] when the renderer instantiates the node,
/// [`OceanNode::reconfigure`] whenever node parameters are (re)committed
/// (every live context is invalidated, since uniform values are baked into
/// contexts at build time), drop on node teardown. Generated kernel temp
/// files outlive all of these by design.
pub struct OceanNode<E: EvalEngine> {
    engine: E,
    params: OceanParams,
    materializer: Mutex<Materializer>,
    pool: SlotPool<E::Context>,
}

impl<E: EvalEngine> OceanNode<E> {
    pub fn new(engine: E, params: OceanParams) -> Self {
        Self {
            engine,
            params,
            materializer: Mutex::new(Materializer {
                alloc: TempNameAllocator::new(),
                last_program: None,
            }),
            pool: SlotPool::new(),
        }
    }

    pub fn params(&self) -> &OceanParams {
        &self.params
    }

    /// Commit a new parameter set. Every thread's context is destroyed and
    /// rebuilt lazily on that thread's next evaluation.
    pub fn reconfigure(&mut self, params: OceanParams) {
        self.params = params;
        self.pool.invalidate_all();
    }

    /// Path of the most recently materialized kernel file, for diagnostics.
    pub fn last_program_path(&self) -> Option<PathBuf> {
        self.materializer
            .lock()
            .ok()
            .and_then(|m| m.last_program.clone())
    }

    /// Evaluate the displacement field for one shading point.
    ///
    /// Never fails upward: every error path degrades to [`Rgba::ZERO`]
    /// (the point renders undisplaced) and reports through the log channel.
    /// The first call on each worker thread builds that thread's context;
    /// steady-state calls only marshal and run.
    pub fn evaluate(&self, sp: &ShadingPoint) -> Rgba {
        let tid = sp.thread_index;
        let Some(slot) = self.pool.slot(tid) else {
            log::warn!("shading thread index {tid} outside slot pool ({MAX_RENDER_THREADS})");
            return Rgba::ZERO;
        };

        // A failed claim means two in-flight evaluations share one thread
        // index, a renderer protocol violation. Degrade rather than race.
        let Some(mut claim) = slot.try_claim() else {
            log::warn!("thread slot {tid} is already in use; dropping sample");
            return Rgba::ZERO;
        };

        let state = claim.state();
        match self.get_or_build(state) {
            Some(bound) => self.shade(bound, sp),
            None => Rgba::ZERO,
        }
    }

    /// Return this slot's context, building and publishing it on first use.
    ///
    /// A context is published only after load and uniform binding fully
    /// succeed; on failure the slot stays empty and the next call on this
    /// thread retries the whole build (a transiently broken filesystem or
    /// engine self-heals, no poisoned state is kept).
    fn get_or_build<'s>(
        &self,
        state: &'s mut SlotState<E::Context>,
    ) -> Option<&'s mut BoundContext<E::Context>> {
        if state.ctx.is_none() {
            match self.build_context(&mut state.uniforms) {
                Ok(bound) => state.ctx = Some(bound),
                Err(e) => {
                    log::warn!("ocean kernel context build failed: {e:#}");
                    return None;
                }
            }
        }
        state.ctx.as_mut()
    }

    /// Full build sequence: materialize the kernel file (lock-protected),
    /// declare the fixed signature, load, bind uniforms from the node's
    /// current parameters, resolve the binding table.
    fn build_context(&self, scratch: &mut UniformScratch) -> Result<BoundContext<E::Context>> {
        let program_path = {
            let mut m = self
                .materializer
                .lock()
                .map_err(|_| anyhow!("kernel materializer lock poisoned"))?;
            let path = program::materialize(&mut m.alloc)?;
            m.last_program = Some(path.clone());
            path
        };
        let argv = tokenize_command(&program_path.display().to_string());

        let mut ctx = self.engine.create_context();

        // Varying inputs: the renderer's shading frame under kernel names.
        ctx.declare_input("P", ValueKind::Vector3, true);
        ctx.declare_input("Eye", ValueKind::Vector3, true);
        ctx.declare_input("I", ValueKind::Vector3, true);
        ctx.declare_input("dPds", ValueKind::Vector3, true);
        ctx.declare_input("dPdt", ValueKind::Vector3, true);
        ctx.declare_input("N", ValueKind::Vector3, true);
        ctx.declare_input("Ng", ValueKind::Vector3, true);
        ctx.declare_input("s", ValueKind::Float, true);
        ctx.declare_input("t", ValueKind::Float, true);

        // Uniform inputs: one value per node instance per render.
        ctx.declare_input("filename", ValueKind::String, false);
        ctx.declare_input("maskname", ValueKind::String, false);
        ctx.declare_input("time", ValueKind::Float, false);
        ctx.declare_input("depthfalloff", ValueKind::Int, false);
        ctx.declare_input("falloff", ValueKind::Float, false);
        ctx.declare_input("downsample", ValueKind::Int, false);

        ctx.load(&argv).with_context(|| {
            format!(
                "engine rejected generated kernel {}",
                program_path.display()
            )
        })?;

        self.bind_uniforms(&mut ctx, scratch)?;

        let bind = Bindings::resolve(&ctx);
        Ok(BoundContext { ctx, bind })
    }

    /// Write the current uniform parameter values into this thread's
    /// persistent scratch and push them into the context. Happens exactly
    /// once per context lifetime; a uniform the program doesn't declare is
    /// skipped and the kernel's embedded default applies.
    fn bind_uniforms(&self, ctx: &mut E::Context, scratch: &mut UniformScratch) -> Result<()> {
        scratch.time = [self.params.time];
        scratch.falloff = [self.params.falloff];
        scratch.depth_falloff = [self.params.depth_falloff.as_index()];
        scratch.downsample = [self.params.downsample];
        scratch.spectrum.clear();
        scratch.spectrum.push(self.params.spectrum.clone());
        scratch.mask.clear();
        scratch.mask.push(self.params.mask.clone());

        if let Some(h) = ctx.find_input("filename", ValueKind::String) {
            ctx.set(h, ValueRef::String(&scratch.spectrum))
                .context("binding uniform 'filename'")?;
        }
        if let Some(h) = ctx.find_input("maskname", ValueKind::String) {
            ctx.set(h, ValueRef::String(&scratch.mask))
                .context("binding uniform 'maskname'")?;
        }
        if let Some(h) = ctx.find_input("time", ValueKind::Float) {
            ctx.set(h, ValueRef::Float(&scratch.time))
                .context("binding uniform 'time'")?;
        }
        if let Some(h) = ctx.find_input("depthfalloff", ValueKind::Int) {
            ctx.set(h, ValueRef::Int(&scratch.depth_falloff))
                .context("binding uniform 'depthfalloff'")?;
        }
        if let Some(h) = ctx.find_input("falloff", ValueKind::Float) {
            ctx.set(h, ValueRef::Float(&scratch.falloff))
                .context("binding uniform 'falloff'")?;
        }
        if let Some(h) = ctx.find_input("downsample", ValueKind::Int) {
            ctx.set(h, ValueRef::Int(&scratch.downsample))
                .context("binding uniform 'downsample'")?;
        }
        Ok(())
    }

    /// Per-call marshalling: rest policy, varying writes, output arming,
    /// single-point run, readback with the rest-position adjustment.
    fn shade(&self, bound: &mut BoundContext<E::Context>, sp: &ShadingPoint) -> Rgba {
        // The rest-attribute name is re-read from the node parameters every
        // call. This asymmetry with the build-time uniforms is intentional:
        // the read is cheap and the attribute name may legitimately vary in
        // some use patterns, while the remaining parameters stay fixed for
        // the context's lifetime.
        let (reference, use_rest) = resolve_rest(sp, &self.params.rest_attribute);

        let ctx = &mut bound.ctx;
        let bind = &bound.bind;

        set_vec3(ctx, bind.p, reference);
        set_vec3(ctx, bind.eye, sp.eye);
        set_vec3(ctx, bind.incident, sp.incident);
        set_vec3(ctx, bind.dpds, sp.dpds);
        set_vec3(ctx, bind.dpdt, sp.dpdt);
        set_vec3(ctx, bind.normal, sp.normal);
        set_vec3(ctx, bind.geometric_normal, sp.geometric_normal);
        set_float(ctx, bind.s, sp.s);
        set_float(ctx, bind.t, sp.t);

        // Both required outputs must resolve; a displacement without its
        // cusp (or vice versa) would be a misleading partial result.
        let (Some(h_disp), Some(h_cusp)) = (bind.out_displacement, bind.out_cusp) else {
            return Rgba::ZERO;
        };
        set_vec3(ctx, Some(h_disp), Vec3::ZERO);
        set_float(ctx, Some(h_cusp), 0.0);

        if let Err(e) = ctx.run(1) {
            log::warn!("ocean kernel execution failed: {e}");
            return Rgba::ZERO;
        }

        let displacement = ctx
            .output(h_disp)
            .and_then(|v| v.first_vector3())
            .unwrap_or(Vec3::ZERO);
        let cusp = ctx
            .output(h_cusp)
            .and_then(|v| v.first_float())
            .unwrap_or(0.0);

        // With a rest position the kernel saw R, but the point already sits
        // at P: subtract the baked-in displacement (P - R) so the combined
        // result lands where the kernel intended.
        let displacement = if use_rest {
            displacement - (sp.position - reference)
        } else {
            displacement
        };

        Rgba::from_displacement(displacement, cusp)
    }
}

/// Rest-position fallback policy, evaluated per call because attribute
/// availability can differ point to point (e.g. at geometry boundaries).
/// Yields the reference position fed to the kernel as "P" and whether the
/// rest adjustment applies downstream.
fn resolve_rest(sp: &ShadingPoint, rest_attribute: &str) -> (Vec3, bool) {
    match sp.attribute(rest_attribute) {
        Some(rest) => (rest, true),
        None => (sp.position, false),
    }
}

fn set_vec3<C: EvalContext>(ctx: &mut C, handle: Option<Handle>, v: Vec3) {
    let Some(h) = handle else { return };
    if let Err(e) = ctx.set(h, ValueRef::Vector3(std::slice::from_ref(&v))) {
        log::debug!("varying vector write rejected: {e}");
    }
}

fn set_float<C: EvalContext>(ctx: &mut C, handle: Option<Handle>, v: f32) {
    let Some(h) = handle else { return };
    if let Err(e) = ctx.set(h, ValueRef::Float(std::slice::from_ref(&v))) {
        log::debug!("varying float write rejected: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_policy_prefers_attribute() {
        let p = ShadingPoint::at(Vec3::new(1.0, 2.0, 3.0), 0)
            .with_attribute("rest", Vec3::new(1.0, 2.0, 2.5));
        let (reference, use_rest) = resolve_rest(&p, "rest");
        assert!(use_rest);
        assert_eq!(reference, Vec3::new(1.0, 2.0, 2.5));
    }

    #[test]
    fn rest_policy_falls_back_to_current_position() {
        let p = ShadingPoint::at(Vec3::new(1.0, 2.0, 3.0), 0);
        let (reference, use_rest) = resolve_rest(&p, "rest");
        assert!(!use_rest);
        assert_eq!(reference, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn rest_policy_honors_custom_attribute_name() {
        let p = ShadingPoint::at(Vec3::ZERO, 0).with_attribute("Pref", Vec3::new(9.0, 0.0, 0.0));
        assert!(!resolve_rest(&p, "rest").1);
        assert!(resolve_rest(&p, "Pref").1);
    }
}
