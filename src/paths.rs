use std::path::{Path, PathBuf};

use crate::config::{CONFIG_DIR, PathsConfig};

/// Concrete locations of every file the supervisor and worker share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub state_dir: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub event_db: PathBuf,
    pub sensor_file: PathBuf,
}

impl StatePaths {
    pub fn resolve(paths: &PathsConfig, config_path: Option<&Path>, cwd: &Path) -> Self {
        let state_dir = resolve_state_dir(paths.state_dir.as_deref(), config_path, cwd);
        let within = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                state_dir.join(p)
            }
        };
        Self {
            pid_file: within(&paths.pid_file),
            log_file: within(&paths.log_file),
            event_db: within(&paths.event_db),
            sensor_file: within(&paths.sensor_file),
            state_dir,
        }
    }

    /// All files under one directory with default names. Used by tests and
    /// embedders that don't load a config file.
    pub fn in_dir(state_dir: &Path) -> Self {
        let paths = PathsConfig {
            state_dir: Some(state_dir.to_path_buf()),
            ..PathsConfig::default()
        };
        Self::resolve(&paths, None, Path::new("/"))
    }
}

/// Resolve the state directory.
///
/// An explicit `state_dir` wins; a relative one is taken from the project root
/// (the directory holding `.screenlogger/`, or `cwd`). Otherwise the
/// `.screenlogger/` directory itself is used.
pub fn resolve_state_dir(configured: Option<&Path>, config_path: Option<&Path>, cwd: &Path) -> PathBuf {
    let config_dir = config_path.and_then(Path::parent);
    match configured {
        Some(dir) if dir.is_absolute() => dir.to_path_buf(),
        Some(dir) => config_dir
            .and_then(Path::parent)
            .unwrap_or(cwd)
            .join(dir),
        None => config_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.join(CONFIG_DIR)),
    }
}

/// Sidecar used to serialize mutating operations across processes.
pub fn lock_file_for(pid_file: &Path) -> PathBuf {
    let mut name = pid_file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    pid_file.with_file_name(name)
}
