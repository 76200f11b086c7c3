//! Project inspection: memory usage and static code checks.
//!
//! The last configuration and per-step durations live in the `inspect`
//! storage item:
//!
//! ```text
//! { "config": { "projectDir": ..., "env": ..., "memory": true, "code": true },
//!   "metrics": { "<projectDir>:<env>:memory": 1234, ... } }
//! ```

use std::sync::Arc;

use sagaflow_core::{classify, Action, ErrorRecord, FlowError, KeyPattern, RpcRequest, TaskContext};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::actions::{self, InspectConfiguration, InspectProject};
use crate::keys;
use crate::settings::{join_path, ProjectSettings};

const CONFIG_FIELD: &str = "config";
const METRICS_FIELD: &str = "metrics";

fn inspect_storage(ctx: &TaskContext) -> Map<String, Value> {
    ctx.select(|state| {
        state
            .storage_item(keys::INSPECT_STORAGE)
            .and_then(Value::as_object)
            .cloned()
    })
    .unwrap_or_default()
}

fn saved_configuration(ctx: &TaskContext) -> Option<InspectConfiguration> {
    inspect_storage(ctx)
        .remove(CONFIG_FIELD)
        .and_then(|config| serde_json::from_value(config).ok())
}

fn record_metric(
    ctx: &mut TaskContext,
    step: &str,
    configuration: &InspectConfiguration,
    started: Instant,
) -> Result<(), FlowError> {
    let mut storage = inspect_storage(ctx);
    let key = [configuration.project_dir.as_str(), configuration.env.as_str(), step].join(":");
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let metrics = storage
        .entry(METRICS_FIELD)
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(metrics) = metrics.as_object_mut() {
        metrics.insert(key, json!(elapsed_ms));
    }
    ctx.update_storage_item(keys::INSPECT_STORAGE, Value::Object(storage))
}

fn subprocess(args: &[&str]) -> RpcRequest {
    RpcRequest::new("core.call")
        .param(args.to_vec())
        .param(json!({ "force_subprocess": true }))
}

// ============================================================================
// Workflows
// ============================================================================

/// Inspect a project. Failures are caught here: the formatted error is
/// stored in the result entity and handed to the completion callback.
pub(crate) async fn inspect_project(
    action: Action,
    mut ctx: TaskContext,
    settings: Arc<ProjectSettings>,
) -> Result<(), FlowError> {
    let InspectProject { configuration } = action.parse()?;

    match inspect(&mut ctx, &configuration, &settings).await {
        Ok(result) => {
            ctx.end(None, Some(result));
            Ok(())
        }
        Err(err) if err.is_cancelled() => Err(err),
        Err(err) => {
            let message = err.describe();
            warn!(project_dir = %configuration.project_dir, error = %message, "inspection failed");
            ctx.update_entity(keys::INSPECT_RESULT, json!({ "error": message }))?;
            ctx.navigate("/inspect");
            let record = classify(&err).map(|record| ErrorRecord { message, ..record });
            ctx.end(record, None);
            Ok(())
        }
    }
}

async fn inspect(
    ctx: &mut TaskContext,
    configuration: &InspectConfiguration,
    settings: &ProjectSettings,
) -> Result<Value, FlowError> {
    let exists = ctx.select(|state| {
        state
            .entity(keys::PROJECTS)
            .and_then(Value::as_array)
            .is_some_and(|projects| {
                projects
                    .iter()
                    .any(|project| project["path"].as_str() == Some(configuration.project_dir.as_str()))
            })
    });
    if !exists {
        return Err(FlowError::precondition(format!(
            "Can't inspect non-existing project '{}'",
            configuration.project_dir
        )));
    }

    if saved_configuration(ctx).as_ref() == Some(configuration) {
        let cached = ctx.select(|state| state.entity(keys::INSPECT_RESULT).cloned());
        if let Some(cached) = cached.filter(|result| result.get("error").is_none()) {
            debug!(project_dir = %configuration.project_dir, "reusing inspection result");
            return Ok(cached);
        }
    }

    ctx.delete_entities(KeyPattern::exact(keys::INSPECT_RESULT))?;
    let mut storage = inspect_storage(ctx);
    storage.insert(CONFIG_FIELD.into(), serde_json::to_value(configuration)?);
    ctx.update_storage_item(keys::INSPECT_STORAGE, Value::Object(storage))?;
    ctx.navigate("/inspect/processing");

    let mut memory = Value::Null;
    if configuration.memory {
        memory = inspect_memory(ctx, configuration, settings)
            .await?
            .ok_or_else(|| FlowError::unknown("Memory inspect returned no result"))?;
        ctx.update_entity(keys::INSPECT_RESULT, json!({ "memory": memory }))?;
    }

    let mut code_checks = Value::Null;
    if configuration.code {
        code_checks = inspect_code(ctx, configuration).await?;
    }

    let result = json!({ "memory": memory, "codeChecks": code_checks });
    ctx.update_entity(keys::INSPECT_RESULT, result.clone())?;
    ctx.navigate("/inspect/result");
    Ok(result)
}

async fn inspect_memory(
    ctx: &mut TaskContext,
    configuration: &InspectConfiguration,
    settings: &ProjectSettings,
) -> Result<Option<Value>, FlowError> {
    let started = Instant::now();
    let InspectConfiguration { project_dir, env, .. } = configuration;

    ctx.rpc(subprocess(&["run", "-d", project_dir.as_str(), "-e", env.as_str(), "-t", "sizedata"]))
        .await?;
    let build_dir = ctx
        .rpc(
            RpcRequest::new("project.config_call")
                .param(json!({ "path": settings.config_path(project_dir) }))
                .param("get_optional_dir")
                .param("build"),
        )
        .await?;
    let build_dir = build_dir
        .as_str()
        .ok_or_else(|| FlowError::MalformedResponse("build dir is not a string".into()))?;
    let sizedata_path = join_path(&[build_dir, env.as_str(), "sizedata.json"]);

    let content = ctx
        .rpc(RpcRequest::new("os.request_content").param(sizedata_path))
        .await?;
    let content = match content {
        Value::String(text) if !text.is_empty() => text,
        _ => return Ok(None),
    };
    let sizedata: Value = serde_json::from_str(&content)?;
    record_metric(ctx, "memory", configuration, started)?;
    Ok(Some(sizedata))
}

/// Run the checker with JSON output; when that fails, rerun it verbosely
/// so the error carries the tool's own output.
async fn inspect_code(ctx: &mut TaskContext, configuration: &InspectConfiguration) -> Result<Value, FlowError> {
    let started = Instant::now();
    let InspectConfiguration { project_dir, env, .. } = configuration;

    let first_error = match ctx
        .rpc(subprocess(&["check", "-d", project_dir.as_str(), "-e", env.as_str(), "--json-output"]))
        .await
    {
        Ok(checks) => {
            record_metric(ctx, "code", configuration, started)?;
            return Ok(checks);
        }
        Err(err) if err.is_cancelled() => return Err(err),
        Err(err) => err,
    };
    warn!(error = %first_error, "code check failed, rerunning verbosely");

    match ctx
        .rpc(subprocess(&["check", "-d", project_dir.as_str(), "-e", env.as_str(), "--verbose"]))
        .await
    {
        Err(FlowError::Rpc {
            data: Some(data), ..
        }) => {
            let output = match data {
                Value::String(text) => text,
                other => other.to_string(),
            };
            Err(FlowError::unknown(output.replace("\\n", "\n")))
        }
        Err(err) if err.is_cancelled() => Err(err),
        _ => Err(first_error),
    }
}

/// Run the last saved inspection again, with this action's completion.
pub(crate) async fn reinspect_project(_action: Action, mut ctx: TaskContext) -> Result<(), FlowError> {
    let configuration = saved_configuration(&ctx)
        .ok_or_else(|| FlowError::precondition("No inspection configuration to run again"))?;

    ctx.delete_entities(KeyPattern::exact(keys::INSPECT_RESULT))?;
    let mut inspect = actions::inspect_project(configuration);
    let completion = ctx.hand_off_completion();
    if let Some(completion) = &completion {
        inspect = inspect.with_completion(completion.clone());
    }
    ctx.dispatch(inspect).inspect_err(|_| {
        if let Some(completion) = &completion {
            completion.fire(None, None);
        }
    })
}
