//! Recent projects, discovery and project import workflows.

use std::sync::Arc;

use sagaflow_core::{
    classify, kinds, Action, Effect, ErrorKind, ErrorRecord, FlowError, KeyPattern, Notification,
    Race, RpcRequest, TaskContext,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::actions::{
    self, AddProject, ImportArduinoProject, InitProject, LoadProjects, ProjectDir, RenameFile,
    PROJECTS_LOADED,
};
use crate::keys;
use crate::settings::ProjectSettings;

const ARDUINO_HINT: &str =
    "Project should contain .ino or .pde file with the same name as project folder";

// ============================================================================
// Helpers
// ============================================================================

fn recent_projects(ctx: &TaskContext) -> Vec<String> {
    ctx.select(|state| {
        state
            .storage_item(keys::RECENT_PROJECTS)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    })
    .unwrap_or_default()
}

fn save_recent_projects(ctx: &mut TaskContext, dirs: Vec<String>) -> Result<(), FlowError> {
    ctx.update_storage_item(keys::RECENT_PROJECTS, json!(dirs))?;
    ctx.dispatch(Action::new(kinds::SAVE_STATE))
}

/// Drop the cached project list and load it again.
fn reload_projects(ctx: &mut TaskContext, force: bool) -> Result<(), FlowError> {
    ctx.delete_entities(KeyPattern::prefix(keys::PROJECTS))?;
    ctx.dispatch(actions::load_projects(force))
}

fn display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Hand a caught failure to the completion callback.
fn end_with_error(ctx: &TaskContext, err: &FlowError) {
    ctx.end(classify(err), None);
}

/// Dispatch `LOAD_PROJECTS` and wait until the list is loaded.
pub async fn preload_projects(ctx: &mut TaskContext) -> Result<(), FlowError> {
    ctx.dispatch(actions::load_projects(false))?;
    ctx.take(PROJECTS_LOADED).await?;
    Ok(())
}

// ============================================================================
// Recent projects
// ============================================================================

pub(crate) async fn add_project(
    action: Action,
    mut ctx: TaskContext,
    settings: Arc<ProjectSettings>,
) -> Result<(), FlowError> {
    let AddProject { project_dir, options } = action.parse()?;
    let config_path = settings.config_path(&project_dir);
    let is_project = ctx
        .rpc(RpcRequest::new("os.is_file").param(config_path))
        .await?;

    if !is_project.as_bool().unwrap_or(false) {
        let message = format!(
            "This is not a project (should contain \"{}\" file).",
            settings.config_file_name
        );
        debug!(project_dir = %project_dir, "rejected directory without config file");
        ctx.end(
            Some(ErrorRecord::new(ErrorKind::PreconditionFailed, message)),
            Some(json!(project_dir)),
        );
        return Ok(());
    }

    let mut recent = recent_projects(&ctx);
    if !recent.contains(&project_dir) {
        recent.push(project_dir.clone());
        save_recent_projects(&mut ctx, recent)?;
    }
    if options.with_reload {
        reload_projects(&mut ctx, false)?;
    }
    if options.with_open {
        ctx.dispatch(actions::open_project(project_dir.clone()))?;
    }
    ctx.end(None, Some(json!(project_dir)));
    Ok(())
}

pub(crate) async fn hide_project(action: Action, mut ctx: TaskContext) -> Result<(), FlowError> {
    let ProjectDir { project_dir } = action.parse()?;
    let recent: Vec<String> = recent_projects(&ctx)
        .into_iter()
        .filter(|dir| *dir != project_dir)
        .collect();
    let projects: Vec<Value> = ctx.select(|state| {
        state
            .entity(keys::PROJECTS)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item["path"].as_str() != Some(project_dir.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    });

    save_recent_projects(&mut ctx, recent)?;
    ctx.update_entity(keys::PROJECTS, Value::Array(projects))?;
    Ok(())
}

pub(crate) async fn rename_project(action: Action, mut ctx: TaskContext) -> Result<(), FlowError> {
    let RenameFile { src, dst } = action.parse()?;
    let mut recent = recent_projects(&ctx);
    if !recent.contains(&src) {
        return Ok(());
    }
    if !recent.contains(&dst) {
        recent.push(dst);
    }
    recent.retain(|dir| *dir != src);
    save_recent_projects(&mut ctx, recent)?;

    if ctx.select(|state| state.has_entity(keys::PROJECTS)) {
        reload_projects(&mut ctx, false)?;
    }
    Ok(())
}

pub(crate) async fn open_project(action: Action, mut ctx: TaskContext) -> Result<(), FlowError> {
    let ProjectDir { project_dir } = action.parse()?;
    let request = RpcRequest::new("ide.send_command")
        .param("open_project")
        .param(project_dir.clone());

    match ctx.rpc(request).await {
        Ok(_) => return Ok(()),
        Err(err) if err.is_cancelled() => return Err(err),
        Err(err) => {
            warn!(project_dir = %project_dir, error = %err, "IDE could not open project");
            ctx.dispatch(actions::os_reveal_file(project_dir.clone()))?;
        }
    }
    ctx.notify_success(
        "Open Project...",
        Some(format!(
            "Project has been successfully configured and is located by this path: {project_dir}."
        )),
    )
}

// ============================================================================
// Project list
// ============================================================================

pub(crate) async fn load_projects(
    action: Action,
    mut ctx: TaskContext,
    settings: Arc<ProjectSettings>,
) -> Result<(), FlowError> {
    let LoadProjects { force } = action.parse()?;
    if !force && ctx.select(|state| state.has_entity(keys::PROJECTS)) {
        return ctx.dispatch(actions::projects_loaded());
    }

    match sync_ide_projects(&mut ctx, &settings).await {
        Err(err) if err.is_cancelled() => return Err(err),
        Err(err) => warn!(error = %err, "could not fetch projects from IDE"),
        Ok(()) => {}
    }

    match ctx.rpc(RpcRequest::new("project.get_projects")).await {
        Ok(items) => {
            ctx.update_entity(keys::PROJECTS, items)?;
            ctx.dispatch(actions::projects_loaded())
        }
        Err(err) if err.is_cancelled() => Err(err),
        Err(err) => ctx.notify_error("Could not load recent projects", &err),
    }
}

/// Merge project directories known to the IDE into the recent projects.
async fn sync_ide_projects(ctx: &mut TaskContext, settings: &ProjectSettings) -> Result<(), FlowError> {
    let discovery = Race::new()
        .branch(
            "ideProjects",
            Effect::rpc(RpcRequest::new("ide.send_command").param("get_pio_project_dirs")),
        )
        .branch("timeout", Effect::delay(settings.ide_timeout()));
    let outcome = ctx.race(discovery).await?;
    if outcome.is("timeout") {
        debug!("IDE did not answer project discovery in time");
    }
    let ide_projects: Vec<String> = outcome
        .take_value("ideProjects")
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default();

    let mut recent = recent_projects(ctx);
    let before = recent.len();
    for dir in ide_projects {
        if !recent.contains(&dir) {
            recent.push(dir);
        }
    }
    if recent.len() == before {
        return Ok(());
    }

    if !ctx.select(|state| state.is_storage_ready()) {
        ctx.take(kinds::STORE_READY).await?;
        // Hydration may have replaced the list read above.
        let hydrated = recent_projects(ctx);
        recent = hydrated
            .iter()
            .cloned()
            .chain(recent.into_iter().filter(|dir| !hydrated.contains(dir)))
            .collect();
    }
    save_recent_projects(ctx, recent)?;
    ctx.take(kinds::STATE_SAVED).await?;
    Ok(())
}

pub(crate) async fn load_project_examples(_action: Action, mut ctx: TaskContext) -> Result<(), FlowError> {
    if ctx.select(|state| state.has_entity(keys::PROJECT_EXAMPLES)) {
        return Ok(());
    }
    match ctx.rpc(RpcRequest::new("project.get_project_examples")).await {
        Ok(items) => ctx.update_entity(keys::PROJECT_EXAMPLES, items),
        Err(err) if err.is_cancelled() => Err(err),
        Err(err) => ctx.notify_error("Could not load project examples", &err),
    }
}

/// Platform changes invalidate the examples list.
pub(crate) async fn cleanup_project_examples(_action: Action, mut ctx: TaskContext) -> Result<(), FlowError> {
    ctx.delete_entities(KeyPattern::prefix(keys::PROJECT_EXAMPLES))
}

// ============================================================================
// Import and init
// ============================================================================

pub(crate) async fn import_project(action: Action, mut ctx: TaskContext) -> Result<(), FlowError> {
    let ProjectDir { project_dir } = action.parse()?;
    let request = RpcRequest::new("project.import_pio").param(project_dir);

    match ctx.rpc(request).await {
        Ok(result) => {
            ctx.notify_success(
                "Project has been successfully imported",
                Some(format!("Location: {}", display(&result))),
            )?;
            ctx.end(None, Some(result));
        }
        Err(err) if err.is_cancelled() => return Err(err),
        Err(err) => {
            ctx.notify_error("Could not import project", &err)?;
            end_with_error(&ctx, &err);
        }
    }
    Ok(())
}

pub(crate) async fn init_project(action: Action, mut ctx: TaskContext) -> Result<(), FlowError> {
    let InitProject {
        board,
        framework,
        project_dir,
        spine_dir,
        build_dir,
    } = action.parse()?;
    let request = RpcRequest::new("project.init")
        .param(board.clone())
        .param(framework.clone())
        .param(project_dir.clone())
        .param(spine_dir)
        .param(build_dir);

    match ctx.rpc(request).await {
        Ok(result) => {
            ctx.notify_success(
                "Project has been successfully initialized",
                Some(format!(
                    "Board: {board}, framework: {framework}, location: {}",
                    display(&result)
                )),
            )?;
            ctx.end(None, Some(result));
        }
        Err(err) if err.is_cancelled() => return Err(err),
        Err(err) => {
            warn!(board = %board, framework = %framework, project_dir = %project_dir, "project init failed");
            ctx.notify_error("Could not initialize project", &err)?;
            end_with_error(&ctx, &err);
        }
    }
    Ok(())
}

pub(crate) async fn import_arduino_project(action: Action, mut ctx: TaskContext) -> Result<(), FlowError> {
    let ImportArduinoProject {
        board,
        use_arduino_libs,
        arduino_project_dir,
    } = action.parse()?;
    let request = RpcRequest::new("project.import_arduino")
        .param(board.clone())
        .param(use_arduino_libs)
        .param(arduino_project_dir);

    match ctx.rpc(request).await {
        Ok(result) => {
            ctx.notify_success(
                "Project has been successfully imported",
                Some(format!("Board: {board}, new location: {}", display(&result))),
            )?;
            ctx.end(None, Some(result));
        }
        Err(err) if err.is_cancelled() => return Err(err),
        Err(err) => {
            match &err {
                FlowError::Rpc { message, .. } if message.contains("Not an Arduino project") => {
                    let hint = Notification {
                        title: format!("{message} ({ARDUINO_HINT})"),
                        detail: None,
                    };
                    ctx.dispatch(Action::with_payload(kinds::NOTIFY_ERROR, serde_json::to_value(hint)?))?;
                }
                _ => ctx.notify_error("Could not import Arduino project", &err)?,
            }
            end_with_error(&ctx, &err);
        }
    }
    Ok(())
}
