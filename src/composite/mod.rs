//! Composite workflow orchestrator
//!
//! Runs named multi-step workflows against the endpoint registry:
//! `POST /api/{env}/composite/{name}`. Steps execute strictly sequentially
//! in declared order; each result lands in the execution context under the
//! step's name, and any step failure aborts the whole composite
//! (fail-fast) with the partial results attached to the error.
//!
//! Step payload selection, in priority order:
//! 1. fan-out over a named array property of the request body
//! 2. the result of the step named by `DependsOn`
//! 3. a named property of the request body (`SourceProperty`)
//! 4. the whole request body
//!
//! Payloads crossing step boundaries are deep copies; a later step can
//! never mutate an earlier step's stored result.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::EnvironmentSettings;
use crate::models::{
    CompositeDefinition, CompositeResult, CompositeStep, ExecutionContext,
};
use crate::registry::EndpointRegistry;

pub mod template;

const STEP_ACCEPT: &str = "application/json,text/javascript; charset=utf-8";

/// A failed composite run: which step broke, why, and everything that
/// completed before it. Serialized as the 400 response body.
#[derive(Debug)]
pub struct CompositeFailure {
    pub step: String,
    pub message: String,
    pub details: Option<Value>,
    pub partial: CompositeResult,
}

/// One step's failure before it is folded into a `CompositeFailure`
struct StepError {
    message: String,
    details: Option<Value>,
}

pub struct CompositeOrchestrator {
    client: reqwest::Client,
    server_name: String,
    environments: Arc<EnvironmentSettings>,
}

impl CompositeOrchestrator {
    pub fn new(
        client: reqwest::Client,
        server_name: String,
        environments: Arc<EnvironmentSettings>,
    ) -> Self {
        Self {
            client,
            server_name,
            environments,
        }
    }

    pub fn environment_allowed(&self, env: &str) -> bool {
        self.environments.allows(env)
    }

    /// Execute every step of `definition` against `request_body`.
    pub async fn execute(
        &self,
        registry: &EndpointRegistry,
        env: &str,
        definition: &CompositeDefinition,
        request_body: Value,
    ) -> Result<CompositeResult, Box<CompositeFailure>> {
        let context = ExecutionContext::new();
        let mut result = CompositeResult::new();

        debug!(
            "Starting composite '{}' ({} steps), request id {}",
            definition.name,
            definition.steps.len(),
            context.request_id
        );

        for step in &definition.steps {
            match self
                .run_step(registry, env, step, &context, &request_body, &result.step_results)
                .await
            {
                Ok(value) => {
                    result.step_results.insert(step.name.clone(), value);
                }
                Err(error) => {
                    warn!(
                        "Composite '{}' failed at step '{}': {}",
                        definition.name, step.name, error.message
                    );
                    result.success = false;
                    result.error_step = Some(step.name.clone());
                    result.error_message = Some(error.message.clone());
                    return Err(Box::new(CompositeFailure {
                        step: step.name.clone(),
                        message: error.message,
                        details: error.details,
                        partial: result,
                    }));
                }
            }
        }

        Ok(result)
    }

    /// Run one step, fan-out included. The returned value is what gets
    /// stored under the step's name.
    async fn run_step(
        &self,
        registry: &EndpointRegistry,
        env: &str,
        step: &CompositeStep,
        context: &ExecutionContext,
        request_body: &Value,
        step_results: &BTreeMap<String, Value>,
    ) -> Result<Value, StepError> {
        // Fan-out: one dispatch per array element
        if step.is_array {
            if let Some(items) = step
                .array_property
                .as_deref()
                .and_then(|prop| request_body.get(prop))
                .and_then(Value::as_array)
            {
                let mut results = Vec::with_capacity(items.len());
                for item in items {
                    let payload = self.transform(item.clone(), step, context, step_results);
                    results.push(self.dispatch(registry, env, step, payload).await?);
                }
                return Ok(Value::Array(results));
            }
        }

        let payload = self.select_payload(step, request_body, step_results);
        let payload = self.transform(payload, step, context, step_results);
        self.dispatch(registry, env, step, payload).await
    }

    /// Non-fan-out payload selection (priority rules 2-4)
    fn select_payload(
        &self,
        step: &CompositeStep,
        request_body: &Value,
        step_results: &BTreeMap<String, Value>,
    ) -> Value {
        if let Some(dependency) = &step.depends_on {
            if let Some(previous) = step_results.get(dependency) {
                return previous.clone();
            }
        }

        if let Some(property) = &step.source_property {
            if let Some(value) = request_body.get(property) {
                return value.clone();
            }
        }

        request_body.clone()
    }

    /// Apply the step's template transformations to an object payload
    fn transform(
        &self,
        mut payload: Value,
        step: &CompositeStep,
        context: &ExecutionContext,
        step_results: &BTreeMap<String, Value>,
    ) -> Value {
        if step.template_transformations.is_empty() {
            return payload;
        }

        if let Value::Object(fields) = &mut payload {
            for (field, expression) in &step.template_transformations {
                let value = template::resolve(expression, context, step_results);
                fields.insert(field.clone(), value);
            }
        }

        payload
    }

    /// Send one step request and decode the response
    async fn dispatch(
        &self,
        registry: &EndpointRegistry,
        env: &str,
        step: &CompositeStep,
        payload: Value,
    ) -> Result<Value, StepError> {
        let endpoint = registry.get(&step.endpoint).ok_or_else(|| StepError {
            message: format!("Endpoint '{}' not found in registry", step.endpoint),
            details: None,
        })?;

        if !endpoint.allows_method(&step.method) {
            return Err(StepError {
                message: format!(
                    "Method '{}' not allowed for endpoint '{}'",
                    step.method, step.endpoint
                ),
                details: None,
            });
        }

        let method =
            reqwest::Method::from_bytes(step.method.as_bytes()).map_err(|_| StepError {
                message: format!("Invalid method token '{}'", step.method),
                details: None,
            })?;
        let carries_body = !matches!(step.method.as_str(), "GET" | "DELETE");

        let mut builder = self
            .client
            .request(method, &endpoint.url)
            .header("servername", &self.server_name)
            .header("databasename", env)
            .header("accept", STEP_ACCEPT);

        if carries_body {
            builder = builder
                .header("content-type", "application/json; charset=utf-8")
                .body(payload.to_string());
        }

        let response = builder.send().await.map_err(|e| StepError {
            message: format!("Request to endpoint '{}' failed: {e}", step.endpoint),
            details: None,
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| StepError {
            message: format!("Reading response from endpoint '{}' failed: {e}", step.endpoint),
            details: None,
        })?;

        if !status.is_success() {
            return Err(StepError {
                message: format!(
                    "Endpoint '{}' returned status {}",
                    step.endpoint,
                    status.as_u16()
                ),
                details: Some(serde_json::json!({
                    "statusCode": status.as_u16(),
                    "body": body,
                })),
            });
        }

        // JSON when it parses, raw string otherwise
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}
