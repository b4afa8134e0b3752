//! Runtime configuration types and the project manifest.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Runtime configuration for the VM. All three bulk resources are
/// fixed-capacity arrays sized from here at VM construction; exceeding
/// any of them at run time is a fatal error, not a resize.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Operand stack capacity, in value slots.
    pub stack_capacity: usize,
    /// Call-frame stack capacity.
    pub frame_capacity: usize,
    /// Object heap capacity, in objects.
    pub heap_capacity: usize,
    /// Print a `[GC]` line per collection cycle.
    pub trace_gc: bool,
    /// Print aggregate GC statistics after a run.
    pub gc_stats: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_capacity: 1024,
            frame_capacity: 64,
            heap_capacity: 4096,
            trace_gc: false,
            gc_stats: false,
        }
    }
}

/// Project manifest (opal.toml).
#[derive(Debug, Serialize, Deserialize)]
pub struct ProjectManifest {
    pub package: PackageInfo,
    #[serde(default)]
    pub runtime: RuntimeOverrides,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    #[serde(default = "default_entry")]
    pub entry: String,
}

fn default_entry() -> String {
    "src/main.opal".to_string()
}

/// Optional runtime settings from the manifest; unset fields keep the
/// built-in defaults.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RuntimeOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heap_capacity: Option<usize>,
}

impl ProjectManifest {
    /// Load the manifest from a directory.
    pub fn load(dir: &Path) -> Result<Self, String> {
        let manifest_path = dir.join("opal.toml");
        let content = fs::read_to_string(&manifest_path)
            .map_err(|e| format!("failed to read opal.toml: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse opal.toml: {}", e))
    }

    /// Apply the manifest's runtime overrides on top of a config.
    pub fn apply(&self, config: &mut RuntimeConfig) {
        if let Some(n) = self.runtime.stack_capacity {
            config.stack_capacity = n;
        }
        if let Some(n) = self.runtime.frame_capacity {
            config.frame_capacity = n;
        }
        if let Some(n) = self.runtime.heap_capacity {
            config.heap_capacity = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.stack_capacity, 1024);
        assert_eq!(config.frame_capacity, 64);
        assert_eq!(config.heap_capacity, 4096);
        assert!(!config.trace_gc);
    }

    #[test]
    fn test_manifest_parsing_and_overrides() {
        let manifest: ProjectManifest = toml::from_str(
            r#"
            [package]
            name = "demo"

            [runtime]
            heap_capacity = 128
            "#,
        )
        .unwrap();
        assert_eq!(manifest.package.name, "demo");
        assert_eq!(manifest.package.entry, "src/main.opal");

        let mut config = RuntimeConfig::default();
        manifest.apply(&mut config);
        assert_eq!(config.heap_capacity, 128);
        assert_eq!(config.stack_capacity, 1024);
    }

    #[test]
    fn test_manifest_round_trip() {
        let manifest = ProjectManifest {
            package: PackageInfo {
                name: "demo".to_string(),
                entry: "scripts/run.opal".to_string(),
            },
            runtime: RuntimeOverrides {
                stack_capacity: Some(2048),
                frame_capacity: None,
                heap_capacity: None,
            },
        };
        let text = toml::to_string_pretty(&manifest).unwrap();
        let back: ProjectManifest = toml::from_str(&text).unwrap();
        assert_eq!(back.package.entry, "scripts/run.opal");
        assert_eq!(back.runtime.stack_capacity, Some(2048));
        assert_eq!(back.runtime.frame_capacity, None);
    }
}
