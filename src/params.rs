//! Node parameter surface: the only user-facing configuration of the ocean
//! node. Loaded from JSON (demo / tests) or filled in by a renderer adapter.

use serde::{Deserialize, Serialize};

/// Depth-falloff mode applied by the spectral sampler.
///
/// Wire names mirror the renderer's enum-name table
/// ("none", "exponential", "exponentialbyfreq").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthFalloff {
    #[default]
    None,
    Exponential,
    ExponentialByFreq,
}

impl DepthFalloff {
    /// Integer encoding the kernel expects (the enum's declaration order).
    pub fn as_index(self) -> i32 {
        match self {
            DepthFalloff::None => 0,
            DepthFalloff::Exponential => 1,
            DepthFalloff::ExponentialByFreq => 2,
        }
    }
}

/// Declared node parameters.
///
/// `spectrum`, `mask`, `time`, `depth_falloff`, `falloff` and `downsample`
/// are uniform: bound into a thread's evaluation context once, at context
/// build time, and sticky until the node is reconfigured. `rest_attribute`
/// is intentionally NOT uniform in that sense: it is re-read on every
/// shading call (see the marshalling path in `node.rs`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OceanParams {
    /// Path to the ocean spectrum file the sampler loads.
    pub spectrum: String,
    /// Optional mask file path ("" = no mask).
    pub mask: String,
    /// Name of the per-point rest-position attribute.
    pub rest_attribute: String,
    /// Sample time in seconds.
    pub time: f32,
    pub depth_falloff: DepthFalloff,
    /// Falloff exponent, used when `depth_falloff` is not `None`.
    pub falloff: f32,
    /// Spectrum downsample level (0 = full resolution).
    pub downsample: i32,
}

impl Default for OceanParams {
    fn default() -> Self {
        Self {
            spectrum: String::new(),
            mask: String::new(),
            rest_attribute: "rest".to_string(),
            time: 0.0,
            depth_falloff: DepthFalloff::None,
            falloff: 1.0,
            downsample: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_declared_parameters() {
        let p = OceanParams::default();
        assert_eq!(p.spectrum, "");
        assert_eq!(p.mask, "");
        assert_eq!(p.rest_attribute, "rest");
        assert_eq!(p.time, 0.0);
        assert_eq!(p.depth_falloff, DepthFalloff::None);
        assert_eq!(p.falloff, 1.0);
        assert_eq!(p.downsample, 0);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let p: OceanParams =
            serde_json::from_str(r#"{"spectrum": "ocean.spec", "time": 2.5}"#).unwrap();
        assert_eq!(p.spectrum, "ocean.spec");
        assert_eq!(p.time, 2.5);
        assert_eq!(p.rest_attribute, "rest");
        assert_eq!(p.falloff, 1.0);
    }

    #[test]
    fn falloff_mode_wire_names() {
        let p: OceanParams =
            serde_json::from_str(r#"{"depth_falloff": "exponentialbyfreq"}"#).unwrap();
        assert_eq!(p.depth_falloff, DepthFalloff::ExponentialByFreq);
        assert_eq!(p.depth_falloff.as_index(), 2);

        let p: OceanParams = serde_json::from_str(r#"{"depth_falloff": "exponential"}"#).unwrap();
        assert_eq!(p.depth_falloff.as_index(), 1);
    }
}
