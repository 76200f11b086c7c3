//! Action kinds, payloads and constructors for the project workflows.
//!
//! Completion callbacks are attached by the caller with
//! [`Action::on_end`](sagaflow_core::Action::on_end).

use sagaflow_core::Action;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const ADD_PROJECT: &str = "ADD_PROJECT";
pub const HIDE_PROJECT: &str = "HIDE_PROJECT";
pub const OPEN_PROJECT: &str = "OPEN_PROJECT";
pub const IMPORT_PROJECT: &str = "IMPORT_PROJECT";
pub const LOAD_PROJECTS: &str = "LOAD_PROJECTS";
pub const PROJECTS_LOADED: &str = "PROJECTS_LOADED";
pub const INIT_PROJECT: &str = "INIT_PROJECT";
pub const IMPORT_ARDUINO_PROJECT: &str = "IMPORT_ARDUINO_PROJECT";
pub const LOAD_PROJECT_EXAMPLES: &str = "LOAD_PROJECT_EXAMPLES";
pub const LOAD_CONFIG_SCHEMA: &str = "LOAD_CONFIG_SCHEMA";
pub const LOAD_PROJECT_CONFIG: &str = "LOAD_PROJECT_CONFIG";
pub const SAVE_PROJECT_CONFIG: &str = "SAVE_PROJECT_CONFIG";
pub const UPDATE_CONFIG_DESCRIPTION: &str = "UPDATE_CONFIG_DESCRIPTION";

pub const INSPECT_PROJECT: &str = "INSPECT_PROJECT";
pub const REINSPECT_PROJECT: &str = "REINSPECT_PROJECT";

// Produced or consumed by neighbouring modules.
pub const OS_RENAME_FILE: &str = "OS_RENAME_FILE";
pub const OS_REVEAL_FILE: &str = "OS_REVEAL_FILE";
pub const INSTALL_PLATFORM: &str = "INSTALL_PLATFORM";
pub const UNINSTALL_PLATFORM: &str = "UNINSTALL_PLATFORM";
pub const UPDATE_PLATFORM: &str = "UPDATE_PLATFORM";

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddProjectOptions {
    #[serde(default = "enabled")]
    pub with_open: bool,
    #[serde(default = "enabled")]
    pub with_reload: bool,
}

fn enabled() -> bool {
    true
}

impl Default for AddProjectOptions {
    fn default() -> Self {
        Self {
            with_open: true,
            with_reload: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddProject {
    pub project_dir: String,
    #[serde(default)]
    pub options: AddProjectOptions,
}

/// Payload of the actions that only carry a project directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDir {
    pub project_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameFile {
    pub src: String,
    pub dst: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadProjects {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitProject {
    pub board: String,
    pub framework: String,
    pub project_dir: String,
    #[serde(default)]
    pub spine_dir: Option<String>,
    #[serde(default)]
    pub build_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportArduinoProject {
    pub board: String,
    pub use_arduino_libs: bool,
    pub arduino_project_dir: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveOptions {
    /// Modification time of the config file when it was loaded.
    #[serde(default)]
    pub mtime: Option<f64>,
    /// Write even if the file changed since it was loaded.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveProjectConfig {
    pub project_dir: String,
    pub data: Value,
    #[serde(default)]
    pub options: SaveOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfigDescription {
    pub project_dir: String,
    pub description: String,
}

/// What an inspection covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectConfiguration {
    pub project_dir: String,
    pub env: String,
    #[serde(default)]
    pub memory: bool,
    #[serde(default)]
    pub code: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectProject {
    pub configuration: InspectConfiguration,
}

// ============================================================================
// Constructors
// ============================================================================

pub fn add_project(project_dir: impl Into<String>, options: AddProjectOptions) -> Action {
    payload_action(
        ADD_PROJECT,
        AddProject {
            project_dir: project_dir.into(),
            options,
        },
    )
}

pub fn hide_project(project_dir: impl Into<String>) -> Action {
    dir_action(HIDE_PROJECT, project_dir)
}

pub fn open_project(project_dir: impl Into<String>) -> Action {
    dir_action(OPEN_PROJECT, project_dir)
}

pub fn import_project(project_dir: impl Into<String>) -> Action {
    dir_action(IMPORT_PROJECT, project_dir)
}

pub fn load_projects(force: bool) -> Action {
    Action::with_payload(LOAD_PROJECTS, json!({ "force": force }))
}

pub fn projects_loaded() -> Action {
    Action::new(PROJECTS_LOADED)
}

pub fn init_project(request: InitProject) -> Action {
    payload_action(INIT_PROJECT, request)
}

pub fn import_arduino_project(request: ImportArduinoProject) -> Action {
    payload_action(IMPORT_ARDUINO_PROJECT, request)
}

pub fn load_project_examples() -> Action {
    Action::new(LOAD_PROJECT_EXAMPLES)
}

pub fn load_config_schema() -> Action {
    Action::new(LOAD_CONFIG_SCHEMA)
}

pub fn load_project_config(project_dir: impl Into<String>) -> Action {
    dir_action(LOAD_PROJECT_CONFIG, project_dir)
}

pub fn save_project_config(project_dir: impl Into<String>, data: Value, options: SaveOptions) -> Action {
    payload_action(
        SAVE_PROJECT_CONFIG,
        SaveProjectConfig {
            project_dir: project_dir.into(),
            data,
            options,
        },
    )
}

pub fn update_config_description(project_dir: impl Into<String>, description: impl Into<String>) -> Action {
    payload_action(
        UPDATE_CONFIG_DESCRIPTION,
        UpdateConfigDescription {
            project_dir: project_dir.into(),
            description: description.into(),
        },
    )
}

pub fn inspect_project(configuration: InspectConfiguration) -> Action {
    payload_action(INSPECT_PROJECT, InspectProject { configuration })
}

pub fn reinspect_project() -> Action {
    Action::new(REINSPECT_PROJECT)
}

pub fn os_rename_file(src: impl Into<String>, dst: impl Into<String>) -> Action {
    payload_action(
        OS_RENAME_FILE,
        RenameFile {
            src: src.into(),
            dst: dst.into(),
        },
    )
}

pub fn os_reveal_file(path: impl Into<String>) -> Action {
    Action::with_payload(OS_REVEAL_FILE, json!({ "path": path.into() }))
}

fn dir_action(kind: &'static str, project_dir: impl Into<String>) -> Action {
    payload_action(
        kind,
        ProjectDir {
            project_dir: project_dir.into(),
        },
    )
}

fn payload_action(kind: &'static str, payload: impl Serialize) -> Action {
    // Payload structs hold only strings, bools, numbers and JSON values.
    Action::with_payload(kind, serde_json::to_value(payload).unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_project_options_default_to_enabled() {
        let action = Action::with_payload(ADD_PROJECT, json!({"projectDir": "/p"}));
        let parsed: AddProject = action.parse().unwrap();
        assert!(parsed.options.with_open && parsed.options.with_reload);

        let action = add_project(
            "/p",
            AddProjectOptions {
                with_open: false,
                with_reload: true,
            },
        );
        assert_eq!(action.payload()["options"]["withOpen"], json!(false));
    }

    #[test]
    fn load_projects_without_payload_is_not_forced() {
        let parsed: LoadProjects = Action::new(LOAD_PROJECTS).parse().unwrap();
        assert!(!parsed.force);
        assert_eq!(load_projects(true).payload()["force"], json!(true));
    }

    #[test]
    fn inspect_configuration_uses_camel_case() {
        let action = inspect_project(InspectConfiguration {
            project_dir: "/p".into(),
            env: "uno".into(),
            memory: true,
            code: false,
        });
        assert_eq!(action.payload()["configuration"]["projectDir"], json!("/p"));
    }
}
