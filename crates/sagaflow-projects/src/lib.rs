//! # Sagaflow Projects
//!
//! Project management and inspection workflows for a sagaflow engine.
//!
//! ## Watchers
//!
//! | Action                      | Policy     | Entity / storage item            |
//! |-----------------------------|------------|----------------------------------|
//! | `ADD_PROJECT`               | every      | `recentProjects`                 |
//! | `HIDE_PROJECT`              | every      | `recentProjects`, `projects`     |
//! | `OS_RENAME_FILE`            | every      | `recentProjects`                 |
//! | `OPEN_PROJECT`              | every      |                                  |
//! | `LOAD_PROJECTS`             | sequential | `projects`                       |
//! | `LOAD_PROJECT_EXAMPLES`     | sequential | `projectExamples`                |
//! | `*_PLATFORM`                | every      | `projectExamples` (cleared)      |
//! | `IMPORT_PROJECT`            | sequential |                                  |
//! | `INIT_PROJECT`              | sequential |                                  |
//! | `IMPORT_ARDUINO_PROJECT`    | sequential |                                  |
//! | `LOAD_CONFIG_SCHEMA`        | latest     | `configSchema`                   |
//! | `LOAD_PROJECT_CONFIG`       | latest     | `projectConfig`                  |
//! | `SAVE_PROJECT_CONFIG`       | latest     | `projectConfig`                  |
//! | `UPDATE_CONFIG_DESCRIPTION` | latest     | `projects`                       |
//! | `INSPECT_PROJECT`           | latest     | `inspectResult`, `inspect`       |
//! | `REINSPECT_PROJECT`         | latest     | `inspectResult`                  |
//!
//! ## Example
//!
//! ```ignore
//! let handle = sagaflow_projects::register_all(EngineBuilder::new().with_rpc(rpc), ProjectSettings::default())
//!     .build()
//!     .start();
//! handle.dispatch(actions::load_projects(false));
//! ```

use std::future::Future;
use std::sync::Arc;

use sagaflow_core::{Action, EngineBuilder, FlowError, Policy, TaskContext, Watcher, Workflow};

pub mod actions;
mod config;
mod inspect;
pub mod keys;
mod projects;
mod settings;

#[cfg(test)]
mod tests;

pub use config::PROJECT_CONFIG_SAVE_CONSENT_ID;
pub use projects::preload_projects;
pub use settings::{join_path, ProjectSettings};

use actions::*;

/// Bind a workflow that needs the settings.
fn with_settings<F, Fut>(settings: &Arc<ProjectSettings>, workflow: F) -> impl Workflow
where
    F: Fn(Action, TaskContext, Arc<ProjectSettings>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), FlowError>> + Send + 'static,
{
    let settings = settings.clone();
    move |action: Action, ctx: TaskContext| workflow(action, ctx, settings.clone())
}

/// Register every project and inspection watcher, and persist the storage
/// items they own.
pub fn register_all(builder: EngineBuilder, settings: ProjectSettings) -> EngineBuilder {
    let settings = Arc::new(settings);

    builder
        .persist_item(keys::RECENT_PROJECTS)
        .persist_item(keys::INSPECT_STORAGE)
        // Recent projects
        .with_watcher(
            Watcher::new("add_project", Policy::ConcurrentEvery, with_settings(&settings, projects::add_project))
                .on(ADD_PROJECT)
                .with_error_title("Could not add project"),
        )
        .with_watcher(Watcher::new("hide_project", Policy::ConcurrentEvery, projects::hide_project).on(HIDE_PROJECT))
        .with_watcher(
            Watcher::new("rename_project", Policy::ConcurrentEvery, projects::rename_project).on(OS_RENAME_FILE),
        )
        .with_watcher(Watcher::new("open_project", Policy::ConcurrentEvery, projects::open_project).on(OPEN_PROJECT))
        // Project list and examples
        .with_watcher(
            Watcher::new("load_projects", Policy::Sequential, with_settings(&settings, projects::load_projects))
                .on(LOAD_PROJECTS),
        )
        .with_watcher(
            Watcher::new("load_project_examples", Policy::Sequential, projects::load_project_examples)
                .on(LOAD_PROJECT_EXAMPLES),
        )
        .with_watcher(
            Watcher::new("cleanup_project_examples", Policy::ConcurrentEvery, projects::cleanup_project_examples)
                .on(INSTALL_PLATFORM)
                .on(UNINSTALL_PLATFORM)
                .on(UPDATE_PLATFORM),
        )
        // Import and init
        .with_watcher(Watcher::new("import_project", Policy::Sequential, projects::import_project).on(IMPORT_PROJECT))
        .with_watcher(Watcher::new("init_project", Policy::Sequential, projects::init_project).on(INIT_PROJECT))
        .with_watcher(
            Watcher::new("import_arduino_project", Policy::Sequential, projects::import_arduino_project)
                .on(IMPORT_ARDUINO_PROJECT),
        )
        // Project configuration
        .with_watcher(
            Watcher::new("load_config_schema", Policy::SingleFlightLatest, config::load_config_schema)
                .on(LOAD_CONFIG_SCHEMA),
        )
        .with_watcher(
            Watcher::new(
                "load_project_config",
                Policy::SingleFlightLatest,
                with_settings(&settings, config::load_project_config),
            )
            .on(LOAD_PROJECT_CONFIG)
            .with_error_title("Could not load project config")
            .with_fallback_route("/projects"),
        )
        .with_watcher(
            Watcher::new(
                "save_project_config",
                Policy::SingleFlightLatest,
                with_settings(&settings, config::save_project_config),
            )
            .on(SAVE_PROJECT_CONFIG)
            .with_error_title("Could not save project config"),
        )
        .with_watcher(
            Watcher::new(
                "update_config_description",
                Policy::SingleFlightLatest,
                with_settings(&settings, config::update_config_description),
            )
            .on(UPDATE_CONFIG_DESCRIPTION)
            .with_error_title("Could not update project description"),
        )
        // Inspection
        .with_watcher(
            Watcher::new("inspect_project", Policy::SingleFlightLatest, with_settings(&settings, inspect::inspect_project))
                .on(INSPECT_PROJECT),
        )
        .with_watcher(
            Watcher::new("reinspect_project", Policy::SingleFlightLatest, inspect::reinspect_project)
                .on(REINSPECT_PROJECT)
                .with_error_title("Could not inspect project again"),
        )
}
