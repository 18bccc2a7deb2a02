//! Resolved paths under `<project>/.autonomous/`.

use std::path::{Path, PathBuf};

/// Orchestrator-owned locations inside a target project.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: &Path) -> Self {
        let state_dir = root.join(".autonomous");
        Self {
            root: root.to_path_buf(),
            db_path: state_dir.join("db.sqlite3"),
            config_path: state_dir.join("config.toml"),
            state_dir,
        }
    }

    /// Append-only transcript log for one session.
    pub fn session_log_path(&self, session_id: i64) -> PathBuf {
        self.state_dir.join(format!("session-{session_id:03}.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_stable() {
        let paths = ProjectPaths::new(Path::new("/work/app"));
        assert!(paths.db_path.ends_with(".autonomous/db.sqlite3"));
        assert!(paths.config_path.ends_with(".autonomous/config.toml"));
        assert!(
            paths
                .session_log_path(7)
                .ends_with(".autonomous/session-007.log")
        );
    }
}
