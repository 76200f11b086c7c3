use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings shared by the project workflows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    /// How long project discovery waits for the IDE.
    pub ide_timeout_ms: u64,
    /// Modification-time drift tolerated before a config save is refused.
    pub mtime_epsilon: f64,
    /// File that marks a directory as a project.
    pub config_file_name: String,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            ide_timeout_ms: 2000,
            mtime_epsilon: 0.00001,
            config_file_name: "conf.ini".to_string(),
        }
    }
}

impl ProjectSettings {
    pub fn ide_timeout(&self) -> Duration {
        Duration::from_millis(self.ide_timeout_ms)
    }

    /// Path of the project's config file.
    pub fn config_path(&self, project_dir: &str) -> String {
        join_path(&[project_dir, &self.config_file_name])
    }
}

/// Join remote path segments with `/`, without doubling separators.
pub fn join_path(segments: &[&str]) -> String {
    let mut joined = String::new();
    for segment in segments.iter().filter(|segment| !segment.is_empty()) {
        if joined.is_empty() {
            joined.push_str(segment.trim_end_matches('/'));
        } else {
            joined.push('/');
            joined.push_str(segment.trim_matches('/'));
        }
    }
    joined
}
