//! Endpoint registry
//!
//! Builds a case-insensitive mapping from endpoint name to
//! [`EndpointDefinition`] out of a directory tree of JSON definition files,
//! plus a derived mapping of composite name to [`CompositeDefinition`].
//!
//! The endpoint name is the immediate parent directory name of each file,
//! not the file stem; deployments rely on that identity. Loading is
//! deterministic (sorted full paths), per-file failures are logged and
//! skipped, and the finished registry is immutable for the process
//! lifetime: concurrent reads need no locking.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::errors::RegistryError;
use crate::models::{
    CompositeConfigFile, CompositeDefinition, CompositeStep, EndpointDefinition, EndpointFile,
    EndpointKind,
};

/// Immutable catalog of endpoint definitions, keyed case-insensitively
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    /// Lowercased name -> definition
    endpoints: HashMap<String, Arc<EndpointDefinition>>,
}

impl EndpointRegistry {
    /// Load the registry from `root`.
    ///
    /// A missing root directory is created and yields an empty registry; an
    /// empty registry is seeded with two sample definitions and reloaded so
    /// a fresh deployment has something to serve.
    pub fn load(root: &Path) -> Result<Self> {
        if !root.exists() {
            std::fs::create_dir_all(root)
                .with_context(|| format!("Failed to create endpoint root {}", root.display()))?;
            info!("Created endpoint directory {}", root.display());
        }

        let mut registry = Self::scan(root);

        if registry.endpoints.is_empty() {
            info!("Endpoint registry is empty, seeding sample definitions");
            match Self::seed_samples(root) {
                Ok(()) => registry = Self::scan(root),
                // Serve the empty registry rather than refusing to start
                Err(e) => error!("Failed to seed sample endpoints: {}", e),
            }
        }

        info!(
            "Endpoint registry loaded: {} endpoints ({} composite)",
            registry.len(),
            registry.composites().len()
        );
        Ok(registry)
    }

    /// Case-insensitive lookup
    pub fn get(&self, name: &str) -> Option<&Arc<EndpointDefinition>> {
        self.endpoints.get(&name.to_ascii_lowercase())
    }

    /// Composite lookup by endpoint name, case-insensitive
    pub fn composite(&self, name: &str) -> Option<&CompositeDefinition> {
        self.get(name).and_then(|e| e.composite.as_ref())
    }

    /// All definitions that are composite-kind or carry a composite config
    pub fn composites(&self) -> Vec<&Arc<EndpointDefinition>> {
        let mut list: Vec<_> = self
            .endpoints
            .values()
            .filter(|e| e.kind == EndpointKind::Composite || e.composite.is_some())
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Names of all endpoints, sorted, original casing
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.endpoints.values().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        names
    }

    // -- loading internals --------------------------------------------------

    /// One full deterministic scan of the tree. Never fails: an unreadable
    /// root yields an empty registry and an error log.
    fn scan(root: &Path) -> Self {
        let mut files = Vec::new();
        if let Err(e) = collect_json_files(root, &mut files) {
            error!("Failed to scan endpoint directory {}: {}", root.display(), e);
            return Self::default();
        }
        // Deterministic load order; later paths win on name collision
        files.sort();

        let mut endpoints: HashMap<String, Arc<EndpointDefinition>> = HashMap::new();
        for path in &files {
            match load_definition(path) {
                Ok(definition) => {
                    let key = definition.name.to_ascii_lowercase();
                    if endpoints.contains_key(&key) {
                        warn!(
                            "Duplicate endpoint '{}' from {}, later definition wins",
                            definition.name,
                            path.display()
                        );
                    }
                    endpoints.insert(key, Arc::new(definition));
                }
                Err(e) => {
                    warn!("Skipping endpoint file {}: {}", path.display(), e);
                }
            }
        }

        let mut registry = Self { endpoints };
        registry.validate_composites();
        registry
    }

    /// Registry closure: every composite step must name an existing endpoint
    /// and an allowed method, dependencies must point at earlier steps, and
    /// fan-out steps must name their array property. Violating composites
    /// are rejected wholesale.
    fn validate_composites(&mut self) {
        let mut rejected = Vec::new();

        for (key, endpoint) in &self.endpoints {
            let Some(composite) = &endpoint.composite else {
                continue;
            };

            if let Err(reason) = self.check_composite(composite) {
                warn!(
                    "Rejecting composite endpoint '{}': {}",
                    endpoint.name, reason
                );
                rejected.push(key.clone());
            }
        }

        for key in rejected {
            self.endpoints.remove(&key);
        }
    }

    fn check_composite(&self, composite: &CompositeDefinition) -> std::result::Result<(), String> {
        if composite.steps.is_empty() {
            return Err("composite has no steps".to_string());
        }

        let mut seen: Vec<&str> = Vec::new();
        for step in &composite.steps {
            if seen.iter().any(|s| *s == step.name.as_str()) {
                return Err(format!("duplicate step name '{}'", step.name));
            }

            if let Some(dep) = &step.depends_on {
                if !seen.iter().any(|s| *s == dep.as_str()) {
                    return Err(format!(
                        "step '{}' depends on '{}' which is not an earlier step",
                        step.name, dep
                    ));
                }
            }

            if step.is_array
                && step
                    .array_property
                    .as_deref()
                    .map(str::is_empty)
                    .unwrap_or(true)
            {
                return Err(format!(
                    "fan-out step '{}' has no array property",
                    step.name
                ));
            }

            match self.get(&step.endpoint) {
                None => {
                    return Err(format!(
                        "step '{}' targets unknown endpoint '{}'",
                        step.name, step.endpoint
                    ));
                }
                Some(target) => {
                    if !target.allows_method(&step.method) {
                        return Err(format!(
                            "step '{}' uses method '{}' not allowed by endpoint '{}'",
                            step.name, step.method, step.endpoint
                        ));
                    }
                }
            }

            seen.push(&step.name);
        }

        Ok(())
    }

    /// Write one Standard and one Composite sample definition under `root`.
    fn seed_samples(root: &Path) -> Result<()> {
        let items_dir = root.join("Items");
        std::fs::create_dir_all(&items_dir)?;
        std::fs::write(
            items_dir.join("endpoint.json"),
            serde_json::to_string_pretty(&serde_json::json!({
                "Url": "http://localhost:8020/items",
                "Methods": ["GET", "POST"],
                "Type": "Standard"
            }))?,
        )?;

        let batch_dir = root.join("ItemBatch");
        std::fs::create_dir_all(&batch_dir)?;
        std::fs::write(
            batch_dir.join("endpoint.json"),
            serde_json::to_string_pretty(&serde_json::json!({
                "Url": "http://localhost:8020/items",
                "Methods": ["POST"],
                "Type": "Composite",
                "CompositeConfig": {
                    "Name": "ItemBatch",
                    "Description": "Creates a batch of items, one POST per line",
                    "Steps": [
                        {
                            "Name": "CreateItems",
                            "Endpoint": "Items",
                            "Method": "POST",
                            "IsArray": true,
                            "ArrayProperty": "Lines",
                            "TemplateTransformations": { "TransactionKey": "$guid" }
                        }
                    ]
                }
            }))?,
        )?;

        Ok(())
    }
}

/// Recursively collect regular `*.json` files under `dir`
fn collect_json_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            collect_json_files(&path, out)?;
        } else if file_type.is_file()
            && path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("json"))
                .unwrap_or(false)
        {
            out.push(path);
        }
    }
    Ok(())
}

/// Parse and validate a single endpoint file into its domain form.
/// The endpoint name comes from the immediate parent directory.
fn load_definition(path: &Path) -> std::result::Result<EndpointDefinition, RegistryError> {
    let invalid = |reason: &str| RegistryError::Invalid {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    let name = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| invalid("file has no parent directory"))?;

    let contents = std::fs::read_to_string(path).map_err(|e| RegistryError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let file: EndpointFile =
        serde_json::from_str(&contents).map_err(|e| RegistryError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;

    if file.url.trim().is_empty() {
        return Err(invalid("empty Url"));
    }
    if file.methods.is_empty() {
        return Err(invalid("empty Methods"));
    }

    let kind = EndpointKind::parse(file.endpoint_type.as_deref());

    let composite = match &file.composite_config {
        Some(config) => Some(build_composite(&name, config).map_err(|r| invalid(&r))?),
        None if kind == EndpointKind::Composite => {
            return Err(invalid("Type is Composite but CompositeConfig is missing"));
        }
        None => None,
    };

    Ok(EndpointDefinition {
        methods: file
            .methods
            .iter()
            .map(|m| m.trim().to_ascii_uppercase())
            .filter(|m| !m.is_empty())
            .collect(),
        url: file.url.trim().to_string(),
        is_private: file.is_private.unwrap_or(false) || kind == EndpointKind::Private,
        kind,
        composite,
        name,
    })
}

fn build_composite(
    endpoint_name: &str,
    config: &CompositeConfigFile,
) -> std::result::Result<CompositeDefinition, String> {
    if config.steps.is_empty() {
        return Err("CompositeConfig.Steps is empty".to_string());
    }

    let steps = config
        .steps
        .iter()
        .map(|s| CompositeStep {
            name: s.name.clone(),
            endpoint: s.endpoint.clone(),
            method: s.method.trim().to_ascii_uppercase(),
            depends_on: s.depends_on.clone(),
            is_array: s.is_array,
            array_property: s.array_property.clone(),
            source_property: s.source_property.clone(),
            template_transformations: s.template_transformations.clone(),
        })
        .collect();

    Ok(CompositeDefinition {
        name: config
            .name
            .clone()
            .unwrap_or_else(|| endpoint_name.to_string()),
        description: config.description.clone().unwrap_or_default(),
        steps,
    })
}
