use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::header::GeneratedHeader;
use crate::layout::BoundaryContract;

/// What a foreign build needs to link against this library and check that
/// it agrees on the boundary layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryManifest {
    pub crate_name: String,
    pub version: String,
    pub kinds: Vec<String>,
    pub headers: Vec<PathBuf>,
    pub rustc_target: String,
    pub link_libs: Vec<String>,
    pub contract: BoundaryContract,
}

pub struct ManifestGenerator {
    cache_dir: PathBuf,
}

impl ManifestGenerator {
    pub fn new() -> Self {
        Self {
            cache_dir: PathBuf::from(".ffibridge"),
        }
    }

    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn generate_manifest(
        &self,
        crate_name: &str,
        headers: &[GeneratedHeader],
        rustc_target: &str,
    ) -> BoundaryManifest {
        BoundaryManifest {
            crate_name: crate_name.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            // C-linkable kinds only; the rlib serves Rust dependents
            kinds: vec!["staticlib".to_string(), "cdylib".to_string()],
            headers: headers.iter().map(|h| h.header_path.clone()).collect(),
            rustc_target: rustc_target.to_string(),
            link_libs: self.get_system_link_libs(rustc_target),
            contract: BoundaryContract::current(),
        }
    }

    /// Writes the manifest as pretty JSON, to `output` or to the default
    /// location under the cache directory.
    pub fn write_manifest(&self, manifest: &BoundaryManifest, output: Option<&Path>) -> Result<PathBuf> {
        let manifest_path = match output {
            Some(path) => path.to_path_buf(),
            None => self.get_manifest_path(&manifest.crate_name, &manifest.rustc_target),
        };

        if let Some(manifest_parent) = manifest_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(manifest_parent)
                .with_context(|| format!("Failed to create manifest directory: {}", manifest_parent.display()))?;
        }

        let manifest_json = serde_json::to_string_pretty(manifest)
            .context("Failed to serialize manifest to JSON")?;

        fs::write(&manifest_path, manifest_json)
            .with_context(|| format!("Failed to write manifest to {}", manifest_path.display()))?;

        tracing::info!(path = %manifest_path.display(), "generated manifest");

        Ok(manifest_path)
    }

    fn get_manifest_path(&self, crate_name: &str, target_triple: &str) -> PathBuf {
        self.cache_dir
            .join(target_triple)
            .join(format!("{}-manifest.json", crate_name))
    }

    fn get_system_link_libs(&self, rustc_target: &str) -> Vec<String> {
        let mut libs = Vec::new();

        // System libraries a Rust staticlib pulls in
        if rustc_target.contains("linux") {
            libs.extend(["pthread", "dl", "m", "c"].map(String::from));
        } else if rustc_target.contains("darwin") || rustc_target.contains("macos") {
            libs.extend(["System", "pthread", "c"].map(String::from));
        } else if rustc_target.contains("windows") {
            libs.extend(["kernel32", "ntdll", "userenv", "ws2_32"].map(String::from));

            if rustc_target.contains("msvc") {
                libs.extend(["vcruntime", "ucrt"].map(String::from));
            }
        } else if rustc_target.contains("freebsd") {
            libs.extend(["pthread", "c", "m"].map(String::from));
        }

        libs
    }

    pub fn read_manifest(&self, manifest_path: &Path) -> Result<BoundaryManifest> {
        let manifest_content = fs::read_to_string(manifest_path)
            .with_context(|| format!("Failed to read manifest from {}", manifest_path.display()))?;

        let manifest: BoundaryManifest = serde_json::from_str(&manifest_content)
            .with_context(|| format!("Failed to parse manifest JSON from {}", manifest_path.display()))?;

        Ok(manifest)
    }

    /// Checks a manifest against this build: the contract must match the
    /// compiled layout and every listed header must exist.
    pub fn validate_manifest(&self, manifest: &BoundaryManifest) -> Result<()> {
        BoundaryContract::current()
            .verify(&manifest.contract)
            .with_context(|| format!("Manifest for {} disagrees with this build", manifest.crate_name))?;

        for header in &manifest.headers {
            if !header.exists() {
                return Err(anyhow::anyhow!(
                    "Header file does not exist: {}",
                    header.display()
                ));
            }
        }

        Ok(())
    }
}

impl Default for ManifestGenerator {
    fn default() -> Self {
        Self::new()
    }
}
