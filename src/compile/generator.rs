//! Versioned artifact generation.
//!
//! # Responsibilities
//! - Take one model snapshot per generation run
//! - Resolve once per snapshot version and share the result across formats
//! - Cache compiled artifacts per (snapshot version, format)
//!
//! # Design Decisions
//! - The cache is keyed by the snapshot version; any store write bumps the
//!   version and the next request recompiles from a fresh snapshot
//! - Resolution failures block every format of the run

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use thiserror::Error;

use crate::compile::{Artifact, CompileError, CompileInput, TargetFormat};
use crate::config::CompilersConfig;
use crate::model::{ModelSnapshot, ModelStore};
use crate::observability::metrics;
use crate::rules::{resolve, Resolution, ResolveError};

/// Why no artifact was produced.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("rule resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("compilation failed: {0}")]
    Compile(#[from] CompileError),
}

/// Produces artifacts from the current model.
pub struct Generator {
    store: Arc<ModelStore>,
    settings: Arc<CompilersConfig>,
    resolution: Mutex<Option<Arc<Resolution>>>,
    artifacts: DashMap<TargetFormat, Arc<Artifact>>,
}

impl Generator {
    pub fn new(store: Arc<ModelStore>, settings: CompilersConfig) -> Self {
        Self {
            store,
            settings: Arc::new(settings),
            resolution: Mutex::new(None),
            artifacts: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<ModelStore> {
        &self.store
    }

    /// Artifact for `format` from the current snapshot.
    pub fn generate(&self, format: TargetFormat) -> Result<Arc<Artifact>, GenerationError> {
        let snapshot = self.store.snapshot();
        self.generate_from(&snapshot, format)
    }

    /// Artifacts for several formats, all from the same snapshot.
    ///
    /// Fails as a whole if any format fails.
    pub fn generate_all(
        &self,
        formats: &[TargetFormat],
    ) -> Result<BTreeMap<TargetFormat, Arc<Artifact>>, GenerationError> {
        let snapshot = self.store.snapshot();
        let mut artifacts = BTreeMap::new();
        for &format in formats {
            artifacts.insert(format, self.generate_from(&snapshot, format)?);
        }
        Ok(artifacts)
    }

    /// Artifact for `format` from an explicit snapshot.
    pub fn generate_from(
        &self,
        snapshot: &ModelSnapshot,
        format: TargetFormat,
    ) -> Result<Arc<Artifact>, GenerationError> {
        if let Some(cached) = self.artifacts.get(&format) {
            if cached.snapshot_version == snapshot.version {
                metrics::record_generation(format.as_str(), "cached", None);
                return Ok(Arc::clone(cached.value()));
            }
        }

        let started = Instant::now();
        let result = self.compile(snapshot, format);
        match &result {
            Ok(artifact) => {
                metrics::record_generation(format.as_str(), "success", Some(started.elapsed()));
                tracing::info!(
                    format = %format,
                    version = snapshot.version,
                    bytes = artifact.len(),
                    hash = %artifact.hash,
                    dropped = artifact.dropped.len(),
                    "Generated artifact"
                );
            }
            Err(e) => {
                metrics::record_generation(format.as_str(), "error", Some(started.elapsed()));
                tracing::warn!(format = %format, version = snapshot.version, error = %e, "Generation failed");
            }
        }
        result
    }

    fn compile(&self, snapshot: &ModelSnapshot, format: TargetFormat) -> Result<Arc<Artifact>, GenerationError> {
        let resolution = self.resolution_for(snapshot)?;
        let input = CompileInput {
            resolution: &resolution,
            overlay: snapshot.overlay(format),
            settings: &self.settings,
        };
        let artifact = Arc::new(format.compile(&input)?);
        self.artifacts.insert(format, Arc::clone(&artifact));
        Ok(artifact)
    }

    fn resolution_for(&self, snapshot: &ModelSnapshot) -> Result<Arc<Resolution>, ResolveError> {
        let mut cached = self.resolution.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(resolution) = cached.as_ref() {
            if resolution.version() == snapshot.version {
                return Ok(Arc::clone(resolution));
            }
        }
        let resolution = Arc::new(resolve(snapshot)?);
        *cached = Some(Arc::clone(&resolution));
        Ok(resolution)
    }

    /// Drop every cached artifact and resolution.
    pub fn invalidate(&self) {
        self.artifacts.clear();
        *self.resolution.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GroupMember, Node, NodeSource, Protocol, ProxyGroup, Rule, RuleKind, Strategy, Target};
    use crate::rules::Matcher;
    use std::collections::BTreeMap;

    fn store() -> Arc<ModelStore> {
        let store = Arc::new(ModelStore::in_memory());
        store
            .upsert_node(Node {
                id: "n1".into(),
                name: "HK".into(),
                protocol: Protocol::Trojan,
                server: "hk.example.net".into(),
                port: 443,
                params: BTreeMap::new(),
                source: NodeSource::Manual,
                pinned: false,
                enabled: true,
                tags: vec![],
            })
            .unwrap();
        store
            .upsert_group(ProxyGroup {
                name: "Proxy".into(),
                strategy: Strategy::Select,
                members: vec![GroupMember::Node("n1".into())],
                test_url: None,
                interval_secs: None,
                enabled: true,
            })
            .unwrap();
        store
            .upsert_rule(Rule {
                id: "r1".into(),
                position: 10,
                kind: RuleKind::Matcher {
                    matcher: Matcher::DomainSuffix("example.com".into()),
                },
                target: Target::Group("Proxy".into()),
                enabled: true,
            })
            .unwrap();
        store
    }

    #[test]
    fn test_cache_hit_until_version_changes() {
        let store = store();
        let generator = Generator::new(Arc::clone(&store), CompilersConfig::default());

        let first = generator.generate(TargetFormat::RoutingEngine).unwrap();
        let second = generator.generate(TargetFormat::RoutingEngine).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        store.set_overlay(TargetFormat::RoutingEngine, "tun:\n  enable: true\n").unwrap();
        let third = generator.generate(TargetFormat::RoutingEngine).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_ne!(first.hash, third.hash);
        assert!(third.content.ends_with("tun:\n  enable: true\n"));
    }

    #[test]
    fn test_recompile_is_byte_identical() {
        let store = store();
        let generator = Generator::new(Arc::clone(&store), CompilersConfig::default());
        let before = generator.generate_all(&TargetFormat::ALL).unwrap();
        generator.invalidate();
        let after = generator.generate_all(&TargetFormat::ALL).unwrap();
        for format in TargetFormat::ALL {
            assert_eq!(before[&format].content, after[&format].content);
            assert_eq!(before[&format].hash, after[&format].hash);
        }
    }

    #[test]
    fn test_dead_group_blocks_every_format() {
        let store = store();
        store
            .update(|model| {
                model.nodes.iter_mut().for_each(|n| n.enabled = false);
                Ok(())
            })
            .unwrap();
        let generator = Generator::new(store, CompilersConfig::default());
        for format in TargetFormat::ALL {
            let err = generator.generate(format).unwrap_err();
            assert!(matches!(
                err,
                GenerationError::Resolve(ResolveError::UnresolvedGroup { ref group, .. }) if group == "Proxy"
            ));
        }
    }
}
