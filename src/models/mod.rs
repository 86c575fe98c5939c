//! Core data model for the proxy gateway
//!
//! This module holds the typed catalog entries loaded by the endpoint
//! registry, the composite workflow definitions, the per-invocation
//! execution context, and the traffic log entry shape.
//!
//! Two families of types live here:
//! - **File shapes** (`EndpointFile`, `CompositeConfigFile`, ...) mirror the
//!   PascalCase JSON deployment format on disk and exist only for parsing.
//! - **Domain types** (`EndpointDefinition`, `CompositeDefinition`, ...) are
//!   the validated, immutable forms the rest of the gateway works with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// File shapes (PascalCase JSON deployment format)
// ---------------------------------------------------------------------------

/// On-disk endpoint definition file
///
/// The endpoint name is NOT part of the file; it is derived from the
/// immediate parent directory name by the registry loader. Unknown fields
/// are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointFile {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default, rename = "Type")]
    pub endpoint_type: Option<String>,
    #[serde(default)]
    pub is_private: Option<bool>,
    #[serde(default)]
    pub composite_config: Option<CompositeConfigFile>,
}

/// On-disk composite workflow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompositeConfigFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<CompositeStepFile>,
}

/// On-disk composite step definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompositeStepFile {
    pub name: String,
    pub endpoint: String,
    pub method: String,
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub is_array: bool,
    #[serde(default)]
    pub array_property: Option<String>,
    #[serde(default)]
    pub source_property: Option<String>,
    #[serde(default)]
    pub template_transformations: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Endpoint classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointKind {
    Standard,
    Composite,
    Private,
}

impl EndpointKind {
    /// Parse the `Type` field of an endpoint file, case-insensitively.
    /// Unknown values fall back to `Standard`.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.to_ascii_lowercase()).as_deref() {
            Some("composite") => EndpointKind::Composite,
            Some("private") => EndpointKind::Private,
            _ => EndpointKind::Standard,
        }
    }
}

/// A single named, method-filtered proxy target
///
/// Constructed during registry load, then immutable for the process
/// lifetime. A registry reload replaces the whole map atomically.
#[derive(Debug, Clone)]
pub struct EndpointDefinition {
    /// Directory-derived name, unique case-insensitively
    pub name: String,
    /// Absolute upstream base URL
    pub url: String,
    /// Allowed HTTP method tokens, stored uppercase
    pub methods: HashSet<String>,
    pub kind: EndpointKind,
    pub is_private: bool,
    pub composite: Option<CompositeDefinition>,
}

impl EndpointDefinition {
    /// Case-insensitive method gate
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.contains(&method.to_ascii_uppercase())
    }

    /// Whether `/api/{env}/{name}` may reach this endpoint directly.
    /// Private endpoints and composites exist only for workflow steps.
    pub fn directly_accessible(&self) -> bool {
        !self.is_private && self.kind != EndpointKind::Composite
    }
}

/// A validated composite workflow definition
#[derive(Debug, Clone)]
pub struct CompositeDefinition {
    pub name: String,
    pub description: String,
    pub steps: Vec<CompositeStep>,
}

/// One step of a composite workflow
#[derive(Debug, Clone)]
pub struct CompositeStep {
    pub name: String,
    /// Must resolve in the registry
    pub endpoint: String,
    /// Must be in the target endpoint's allowed methods
    pub method: String,
    /// Names an earlier step whose result becomes this step's payload
    pub depends_on: Option<String>,
    /// Fan-out mode: run once per element of `array_property`
    pub is_array: bool,
    pub array_property: Option<String>,
    /// Picks a property of the top-level request object as the payload
    pub source_property: Option<String>,
    /// Target field -> template expression, applied before dispatch
    pub template_transformations: BTreeMap<String, String>,
}

/// Per-invocation state of a composite run
///
/// Created at the start of each composite request and discarded when the
/// request completes.
#[derive(Debug)]
pub struct ExecutionContext {
    pub request_id: Uuid,
    pub variables: HashMap<String, serde_json::Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            variables: HashMap::new(),
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The outcome of a composite invocation, serialized to the caller
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeResult {
    pub success: bool,
    /// Step name -> decoded step result (a list for fan-out steps)
    pub step_results: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl CompositeResult {
    pub fn new() -> Self {
        Self {
            success: true,
            step_results: BTreeMap::new(),
            error_step: None,
            error_message: None,
        }
    }
}

impl Default for CompositeResult {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Traffic log
// ---------------------------------------------------------------------------

/// One structured record per `/api/**` request
///
/// Serialized camelCase; this is the exact NDJSON object shape of the file
/// driver and the column source for the SQL driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficLogEntry {
    /// Short random hex id correlating log lines for one request
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub query: String,
    pub env: String,
    pub endpoint_name: String,
    pub target_url: String,
    pub status_code: u16,
    pub request_size: u64,
    pub response_size: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub client_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    /// Inbound request headers with sensitive values redacted
    pub request_headers: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_kind_parse_is_case_insensitive() {
        assert_eq!(EndpointKind::parse(Some("Composite")), EndpointKind::Composite);
        assert_eq!(EndpointKind::parse(Some("COMPOSITE")), EndpointKind::Composite);
        assert_eq!(EndpointKind::parse(Some("private")), EndpointKind::Private);
        assert_eq!(EndpointKind::parse(Some("Standard")), EndpointKind::Standard);
        assert_eq!(EndpointKind::parse(Some("bogus")), EndpointKind::Standard);
        assert_eq!(EndpointKind::parse(None), EndpointKind::Standard);
    }

    #[test]
    fn test_method_gate_is_case_insensitive() {
        let endpoint = EndpointDefinition {
            name: "Items".to_string(),
            url: "http://upstream:8020/items".to_string(),
            methods: ["GET".to_string(), "POST".to_string()].into_iter().collect(),
            kind: EndpointKind::Standard,
            is_private: false,
            composite: None,
        };

        assert!(endpoint.allows_method("get"));
        assert!(endpoint.allows_method("GET"));
        assert!(endpoint.allows_method("Post"));
        assert!(!endpoint.allows_method("DELETE"));
        assert!(!endpoint.allows_method("MERGE"));
    }

    #[test]
    fn test_private_and_composite_are_not_directly_accessible() {
        let mut endpoint = EndpointDefinition {
            name: "SalesOrderLine".to_string(),
            url: "http://upstream:8020/salesorderline".to_string(),
            methods: ["POST".to_string()].into_iter().collect(),
            kind: EndpointKind::Standard,
            is_private: true,
            composite: None,
        };
        assert!(!endpoint.directly_accessible());

        endpoint.is_private = false;
        assert!(endpoint.directly_accessible());

        endpoint.kind = EndpointKind::Composite;
        assert!(!endpoint.directly_accessible());
    }

    #[test]
    fn test_endpoint_file_ignores_unknown_fields() {
        let raw = r#"{
            "Url": "http://upstream:8020/items",
            "Methods": ["GET"],
            "Type": "Standard",
            "SomeFutureKnob": true
        }"#;

        let parsed: EndpointFile = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.url, "http://upstream:8020/items");
        assert_eq!(parsed.methods, vec!["GET"]);
    }

    #[test]
    fn test_traffic_log_entry_serializes_camel_case() {
        let entry = TrafficLogEntry {
            trace_id: "a1b2c3d4".to_string(),
            timestamp: Utc::now(),
            method: "GET".to_string(),
            path: "/api/dev/Items".to_string(),
            query: "$top=2".to_string(),
            env: "dev".to_string(),
            endpoint_name: "Items".to_string(),
            target_url: "http://upstream:8020/items?$top=2".to_string(),
            status_code: 200,
            request_size: 0,
            response_size: 42,
            duration_ms: 7,
            username: Some("svc-account".to_string()),
            client_ip: "127.0.0.1".to_string(),
            request_body: None,
            response_body: None,
            request_headers: BTreeMap::new(),
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("traceId").is_some());
        assert!(json.get("endpointName").is_some());
        assert!(json.get("statusCode").is_some());
        assert!(json.get("durationMs").is_some());
        // skipped optional fields are absent, not null
        assert!(json.get("requestBody").is_none());
    }
}
