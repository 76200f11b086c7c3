//! Project configuration: schema, load, save and description updates.

use std::collections::BTreeMap;
use std::sync::Arc;

use sagaflow_core::{Action, ConsentRecord, FlowError, KeyPattern, PatchTarget, RpcRequest, TaskContext};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::actions::{self, ProjectDir, SaveOptions, SaveProjectConfig, UpdateConfigDescription};
use crate::keys;
use crate::settings::ProjectSettings;

/// Consent id guarding a full rewrite of the config file.
pub const PROJECT_CONFIG_SAVE_CONSENT_ID: &str = "project-config-save";

const SAVE_WARNING: &str = "Warning! The entire file contents of the config file will be \
rewritten with the current configuration defined in this UI. Continue to save the configuration?";

pub(crate) async fn load_config_schema(_action: Action, mut ctx: TaskContext) -> Result<(), FlowError> {
    let schema = match ctx.rpc(RpcRequest::new("project.get_config_schema")).await {
        Ok(schema) => schema,
        Err(err @ FlowError::Rpc { .. }) => {
            debug!(error = %err, "config schema unavailable");
            return Ok(());
        }
        Err(err) if err.is_cancelled() => return Err(err),
        Err(err) => return ctx.notify_error("Could not load config schema", &err),
    };

    let Value::Array(items) = schema else {
        let err = FlowError::MalformedResponse("config schema is not a list".into());
        return ctx.notify_error("Could not load config schema", &err);
    };
    ctx.update_entity(keys::CONFIG_SCHEMA, json!(group_by_scope(items)))
}

/// Group schema items by their `scope` field, keeping item order.
fn group_by_scope(items: Vec<Value>) -> BTreeMap<String, Vec<Value>> {
    let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for item in items {
        let scope = item["scope"].as_str().unwrap_or_default().to_string();
        grouped.entry(scope).or_default().push(item);
    }
    grouped
}

/// `[[section, [[name, value], ...]], ...]` as returned by `project.config_load`.
#[derive(Deserialize)]
struct RawSection(String, Vec<(String, Value)>);

/// Uncaught failures notify and fall back to the project list.
pub(crate) async fn load_project_config(
    action: Action,
    mut ctx: TaskContext,
    settings: Arc<ProjectSettings>,
) -> Result<(), FlowError> {
    let ProjectDir { project_dir } = action.parse()?;
    ctx.delete_entities(KeyPattern::exact(keys::PROJECT_CONFIG))?;

    let config_path = settings.config_path(&project_dir);
    let raw = ctx
        .rpc(RpcRequest::new("project.config_load").param(config_path.clone()))
        .await?;
    let mtime = ctx
        .rpc(RpcRequest::new("os.get_file_mtime").param(config_path))
        .await?;

    let sections: Vec<RawSection> = serde_json::from_value(raw)?;
    let config: Vec<Value> = sections
        .into_iter()
        .map(|RawSection(section, items)| {
            let items: Vec<Value> = items
                .into_iter()
                .map(|(name, value)| json!({ "name": name, "value": value }))
                .collect();
            json!({ "section": section, "items": items })
        })
        .collect();
    ctx.update_entity(keys::PROJECT_CONFIG, json!({ "config": config, "mtime": mtime }))
}

/// Consent rejection ends silently; a stale file ends with the conflict
/// and no notification; anything else is notified by the engine.
pub(crate) async fn save_project_config(
    action: Action,
    mut ctx: TaskContext,
    settings: Arc<ProjectSettings>,
) -> Result<(), FlowError> {
    let SaveProjectConfig {
        project_dir,
        data,
        options: SaveOptions { mtime, force },
    } = action.parse()?;

    ctx.consent(ConsentRecord::new(PROJECT_CONFIG_SAVE_CONSENT_ID, SAVE_WARNING, "Save"))
        .await?;

    let config_path = settings.config_path(&project_dir);
    if !force {
        if let Some(loaded_at) = mtime {
            let modified_at = file_mtime(&mut ctx, &config_path).await?;
            if modified_at - loaded_at > settings.mtime_epsilon {
                return Err(FlowError::StaleWrite {
                    loaded_at,
                    modified_at,
                });
            }
        }
    }

    ctx.rpc(
        RpcRequest::new("project.config_dump")
            .param(config_path.clone())
            .param(data),
    )
    .await?;
    info!(project_dir = %project_dir, force, "project config saved");
    ctx.notify_success("Project configuration saved", None)?;

    let new_mtime = file_mtime(&mut ctx, &config_path).await?;
    let mut entity = ctx
        .select(|state| state.entity(keys::PROJECT_CONFIG).cloned())
        .unwrap_or_else(|| json!({}));
    if let Some(fields) = entity.as_object_mut() {
        fields.insert("mtime".into(), json!(new_mtime));
    }
    ctx.update_entity(keys::PROJECT_CONFIG, entity)?;
    ctx.dispatch(actions::load_projects(true))?;
    ctx.end(None, None);
    Ok(())
}

async fn file_mtime(ctx: &mut TaskContext, path: &str) -> Result<f64, FlowError> {
    let mtime = ctx
        .rpc(RpcRequest::new("os.get_file_mtime").param(path))
        .await?;
    mtime
        .as_f64()
        .ok_or_else(|| FlowError::MalformedResponse(format!("mtime of {path} is not a number: {mtime}")))
}

pub(crate) async fn update_config_description(
    action: Action,
    mut ctx: TaskContext,
    settings: Arc<ProjectSettings>,
) -> Result<(), FlowError> {
    let UpdateConfigDescription {
        project_dir,
        description,
    } = action.parse()?;

    let patch = ctx.patch(
        PatchTarget::list_item(keys::PROJECTS, "path", project_dir.clone()),
        json!({ "description": description }),
    )?;
    let request = RpcRequest::new("project.config_update_description")
        .param(settings.config_path(&project_dir))
        .param(description);

    match ctx.rpc(request).await {
        Ok(_) => {
            if let Some(patch) = patch {
                patch.confirm();
            }
            ctx.notify_success("Project description is saved into configuration file", None)?;
            ctx.end(None, None);
            Ok(())
        }
        Err(err) => {
            if let Some(patch) = patch {
                ctx.rollback(patch)?;
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_items_are_grouped_by_scope() {
        let grouped = group_by_scope(vec![
            json!({"name": "a", "scope": "env"}),
            json!({"name": "b", "scope": "platformio"}),
            json!({"name": "c", "scope": "env"}),
        ]);
        assert_eq!(grouped["env"].len(), 2);
        assert_eq!(grouped["env"][1]["name"], json!("c"));
        assert_eq!(grouped["platformio"].len(), 1);
    }
}
