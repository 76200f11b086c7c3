//! Shared-state entity keys and storage item keys.

pub const PROJECTS: &str = "projects";
pub const PROJECT_EXAMPLES: &str = "projectExamples";
pub const PROJECT_CONFIG: &str = "projectConfig";
pub const CONFIG_SCHEMA: &str = "configSchema";
pub const INSPECT_RESULT: &str = "inspectResult";

/// Storage item: directories of recently used projects.
pub const RECENT_PROJECTS: &str = "recentProjects";
/// Storage item: last inspection configuration and step durations.
pub const INSPECT_STORAGE: &str = "inspect";
