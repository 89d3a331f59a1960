//! Temporary program materializer.
//!
//! The engine loads kernels from the filesystem, so the fixed ocean kernel
//! is written out as a uniquely-named temp file on first use of each thread
//! slot. Generated files deliberately persist after use: the engine may
//! re-read them for lazy recompilation or debugging, so stale kernels in the
//! temp directory are an accepted side effect rather than a leak.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};

/// Entry point name of the generated kernel.
pub const KERNEL_ENTRY: &str = "oceankernel";

/// File extension the engine's loader expects.
pub const KERNEL_EXT: &str = "vfl";

/// Generate the fixed kernel source.
///
/// The signature is the whole input/output contract of the node: nine
/// varying inputs carrying the shading-point frame, six uniform inputs
/// carrying the node parameters (defaults embedded so a missing uniform
/// falls back inside the kernel), and four exported outputs. The body just
/// delegates to the engine's opaque spectral sampler.
pub fn kernel_source() -> String {
    let mut src = String::new();
    src.push_str("#include <ocean.h>\n\n");
    src.push_str(&format!("cvex {KERNEL_ENTRY}(\n"));
    // Varying: the renderer's shading frame, translated to kernel names.
    src.push_str("    const vector P = {0, 0, 0};\n");
    src.push_str("    const vector Eye = {0, 0, 0};\n");
    src.push_str("    const vector I = {0, 0, 0};\n");
    src.push_str("    const vector dPds = {0, 0, 0};\n");
    src.push_str("    const vector dPdt = {0, 0, 0};\n");
    src.push_str("    const vector N = {0, 1, 0};\n");
    src.push_str("    const vector Ng = {0, 1, 0};\n");
    src.push_str("    const float s = 0;\n");
    src.push_str("    const float t = 0;\n");
    // Uniform: node parameters, one value for all points of a render.
    src.push_str("    const string filename = '';\n");
    src.push_str("    const string maskname = '';\n");
    src.push_str("    const float time = 0;\n");
    src.push_str("    const int depthfalloff = 0;\n");
    src.push_str("    const float falloff = 1;\n");
    src.push_str("    const int downsample = 0;\n");
    src.push_str("    export vector displacement = {0, 0, 0};\n");
    src.push_str("    export vector velocity = {0, 0, 0};\n");
    src.push_str("    export float cusp = 0;\n");
    src.push_str("    export vector cuspdir = {0, 0, 0})\n");
    src.push_str("{\n");
    src.push_str(
        "    oceanSampleLayers(filename, maskname, time, P, 0, depthfalloff, falloff, \
         downsample, displacement, velocity, cusp, cuspdir);\n",
    );
    src.push_str("}\n");
    src
}

/// Distinguishes node instances within one process.
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// Unique temp-file name allocator.
///
/// A bare sequence counter is not thread-safe; callers hold the node's lock
/// across `materialize` so names never collide between concurrently
/// initializing threads of one node. The instance id keeps names from
/// colliding across node instances, and the process id across renderer
/// processes sharing a temp directory.
#[derive(Debug)]
pub struct TempNameAllocator {
    instance: u64,
    seq: u64,
}

impl TempNameAllocator {
    pub fn new() -> Self {
        Self {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            seq: 0,
        }
    }

    fn next_path(&mut self) -> PathBuf {
        let seq = self.seq;
        self.seq += 1;
        let pid = std::process::id();
        std::env::temp_dir().join(format!(
            "ocean_kernel_{pid}_{:03}_{seq:04}.{KERNEL_EXT}",
            self.instance
        ))
    }
}

impl Default for TempNameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Write the kernel source to a fresh uniquely-named file and return its
/// path. Single write-flush-close sequence so the file is fully visible to
/// the loader the moment this returns; any I/O failure surfaces as a build
/// failure rather than a partially-written program.
pub fn materialize(alloc: &mut TempNameAllocator) -> Result<PathBuf> {
    let path = alloc.next_path();
    let mut file = File::create(&path)
        .with_context(|| format!("failed to create kernel temp file {}", path.display()))?;
    file.write_all(kernel_source().as_bytes())
        .with_context(|| format!("failed to write kernel temp file {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush kernel temp file {}", path.display()))?;
    drop(file);

    log::debug!("materialized ocean kernel: {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_source_declares_full_signature() {
        let src = kernel_source();
        assert!(src.contains(KERNEL_ENTRY));
        assert!(src.contains("oceanSampleLayers"));
        for name in [
            "P", "Eye", "I", "dPds", "dPdt", "N", "Ng", "filename", "maskname", "time",
            "depthfalloff", "falloff", "downsample",
        ] {
            assert!(src.contains(name), "missing input '{name}' in kernel source");
        }
        for name in ["displacement", "velocity", "cusp", "cuspdir"] {
            assert!(
                src.contains(&format!("export vector {name}")) || src.contains(&format!("export float {name}")),
                "missing output '{name}' in kernel source"
            );
        }
    }

    #[test]
    fn materialize_writes_readable_file() {
        let mut alloc = TempNameAllocator::new();
        let path = materialize(&mut alloc).unwrap();
        // Immediately readable by a follow-up loader.
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, kernel_source());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn distinct_node_instances_get_distinct_names() {
        let mut a = TempNameAllocator::new();
        let mut b = TempNameAllocator::new();
        assert_ne!(a.next_path(), b.next_path());
    }

    #[test]
    fn allocator_never_reuses_names() {
        let mut alloc = TempNameAllocator::new();
        let a = materialize(&mut alloc).unwrap();
        let b = materialize(&mut alloc).unwrap();
        assert_ne!(a, b);
        let _ = std::fs::remove_file(a);
        let _ = std::fs::remove_file(b);
    }
}
