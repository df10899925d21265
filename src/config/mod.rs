use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILENAME: &str = "config.toml";
pub const CONFIG_DIR: &str = ".screenlogger";

fn default_pid_file() -> PathBuf {
    PathBuf::from("screenlogger.pid")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("screenlogger.log")
}

fn default_event_db() -> PathBuf {
    PathBuf::from("screen_logger.db")
}

fn default_sensor_file() -> PathBuf {
    PathBuf::from("/sys/class/backlight/panel0-backlight/brightness")
}

fn default_discovery_retries() -> u32 {
    20
}

fn default_discovery_interval_millis() -> u64 {
    100
}

fn default_elevation_enabled() -> bool {
    true
}

fn default_elevation_program() -> String {
    "su".to_string()
}

fn default_elevation_args() -> Vec<String> {
    vec!["-c".to_string()]
}

fn default_elevation_timeout_secs() -> u64 {
    5
}

fn default_oom_score_adj() -> i32 {
    -17
}

fn default_stop_grace_millis() -> u64 {
    2000
}

fn default_stop_kill_wait_millis() -> u64 {
    1000
}

fn default_worker_tick_millis() -> u64 {
    1000
}

fn default_poller_interval_secs() -> u64 {
    2
}

/// Where the supervisor keeps its files.
///
/// Relative entries resolve against `state_dir`, which itself defaults to
/// `.screenlogger/` next to the loaded config (or under the working directory).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    #[serde(default = "default_event_db")]
    pub event_db: PathBuf,
    #[serde(default = "default_sensor_file")]
    pub sensor_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            pid_file: default_pid_file(),
            log_file: default_log_file(),
            event_db: default_event_db(),
            sensor_file: default_sensor_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LauncherSettings {
    #[serde(default = "default_discovery_retries")]
    pub discovery_retries: u32,
    #[serde(default = "default_discovery_interval_millis")]
    pub discovery_interval_millis: u64,
    /// Worker program override. Defaults to this executable's `worker` mode.
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            discovery_retries: default_discovery_retries(),
            discovery_interval_millis: default_discovery_interval_millis(),
            program: None,
            args: Vec::new(),
        }
    }
}

impl LauncherSettings {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_millis)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ElevationSettings {
    #[serde(default = "default_elevation_enabled")]
    pub enabled: bool,
    #[serde(default = "default_elevation_program")]
    pub program: String,
    #[serde(default = "default_elevation_args")]
    pub args: Vec<String>,
    #[serde(default = "default_elevation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_oom_score_adj")]
    pub oom_score_adj: i32,
}

impl Default for ElevationSettings {
    fn default() -> Self {
        Self {
            enabled: default_elevation_enabled(),
            program: default_elevation_program(),
            args: default_elevation_args(),
            timeout_secs: default_elevation_timeout_secs(),
            oom_score_adj: default_oom_score_adj(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StopSettings {
    #[serde(default = "default_stop_grace_millis")]
    pub grace_millis: u64,
    #[serde(default = "default_stop_kill_wait_millis")]
    pub kill_wait_millis: u64,
}

impl Default for StopSettings {
    fn default() -> Self {
        Self {
            grace_millis: default_stop_grace_millis(),
            kill_wait_millis: default_stop_kill_wait_millis(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerSettings {
    #[serde(default = "default_worker_tick_millis")]
    pub tick_millis: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            tick_millis: default_worker_tick_millis(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollerSettings {
    #[serde(default = "default_poller_interval_secs")]
    pub interval_secs: u64,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_poller_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub launcher: LauncherSettings,
    #[serde(default)]
    pub elevation: ElevationSettings,
    #[serde(default)]
    pub stop: StopSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub poller: PollerSettings,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.screenlogger/config.toml` file and
    /// load it. Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        match Self::find_config_file(start) {
            Some(path) => Ok((Self::load_file(&path)?, Some(path))),
            None => Ok((ProjectConfig::default(), None)),
        }
    }

    /// Load one specific config file, without searching.
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = ProjectConfig::default();
        assert!(config.paths.state_dir.is_none());
        assert_eq!(config.paths.pid_file, PathBuf::from("screenlogger.pid"));
        assert_eq!(config.paths.log_file, PathBuf::from("screenlogger.log"));
        assert_eq!(config.paths.event_db, PathBuf::from("screen_logger.db"));
        assert_eq!(
            config.paths.sensor_file,
            PathBuf::from("/sys/class/backlight/panel0-backlight/brightness")
        );
        assert_eq!(config.launcher.discovery_retries, 20);
        assert_eq!(
            config.launcher.discovery_interval(),
            Duration::from_millis(100)
        );
        assert!(config.launcher.program.is_none());
        assert!(config.elevation.enabled);
        assert_eq!(config.elevation.program, "su");
        assert_eq!(config.elevation.args, vec!["-c"]);
        assert_eq!(config.elevation.timeout_secs, 5);
        assert_eq!(config.elevation.oom_score_adj, -17);
        assert_eq!(config.stop.grace_millis, 2000);
        assert_eq!(config.stop.kill_wait_millis, 1000);
        assert_eq!(config.worker.tick_millis, 1000);
        assert_eq!(config.poller.interval_secs, 2);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[paths]
state_dir = "/data/screenlogger"
pid_file = "worker.pid"
log_file = "/var/log/screenlogger.log"
event_db = "events.db"
sensor_file = "/sys/class/backlight/intel_backlight/brightness"

[launcher]
discovery_retries = 5
discovery_interval_millis = 50
program = "/usr/local/bin/screenlogger"
args = ["worker"]

[elevation]
enabled = false
program = "sudo"
args = ["-n", "sh", "-c"]
timeout_secs = 2
oom_score_adj = -1000

[stop]
grace_millis = 500
kill_wait_millis = 250

[worker]
tick_millis = 250

[poller]
interval_secs = 10
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            config.paths.state_dir.as_deref(),
            Some(Path::new("/data/screenlogger"))
        );
        assert_eq!(config.paths.pid_file, PathBuf::from("worker.pid"));
        assert_eq!(config.launcher.discovery_retries, 5);
        assert_eq!(
            config.launcher.program.as_deref(),
            Some("/usr/local/bin/screenlogger")
        );
        assert_eq!(config.launcher.args, vec!["worker"]);
        assert!(!config.elevation.enabled);
        assert_eq!(config.elevation.program, "sudo");
        assert_eq!(config.elevation.args, vec!["-n", "sh", "-c"]);
        assert_eq!(config.elevation.oom_score_adj, -1000);
        assert_eq!(config.stop.grace_millis, 500);
        assert_eq!(config.worker.tick_millis, 250);
        assert_eq!(config.poller.interval_secs, 10);
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[elevation]
timeout_secs = 1
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.elevation.timeout_secs, 1);
        assert_eq!(config.elevation.program, "su");
        assert_eq!(config.launcher.discovery_retries, 20);
        assert_eq!(config.paths.pid_file, PathBuf::from("screenlogger.pid"));
    }

    #[test]
    fn load_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(CONFIG_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[stop]
grace_millis = 100
"#,
        )
        .unwrap();

        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert_eq!(path, Some(dir.join("config.toml")));
        assert_eq!(config.stop.grace_millis, 100);
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.elevation.program, "su");
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(CONFIG_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[worker]
tick_millis = 42
"#,
        )
        .unwrap();

        let nested = tmp.path().join("a").join("b").join("c");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = ProjectConfig::load(&nested).unwrap();
        assert!(path.is_some());
        assert_eq!(config.worker.tick_millis, 42);
    }

    #[test]
    fn load_file_reads_config_outside_any_project() {
        let project = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let dir = project.path().join(CONFIG_DIR);
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("config.toml");
        fs::write(&file, "[elevation]\nenabled = false\n\n[worker]\ntick_millis = 75\n").unwrap();

        let (searched, found) = ProjectConfig::load(elsewhere.path()).unwrap();
        assert!(found.is_none());
        assert!(searched.elevation.enabled);

        let config = ProjectConfig::load_file(&file).unwrap();
        assert!(!config.elevation.enabled);
        assert_eq!(config.worker.tick_millis, 75);
    }

    #[test]
    fn load_file_missing_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ProjectConfig::load_file(&tmp.path().join("gone.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn malformed_config_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(CONFIG_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.toml"), "[stop]\ngrace_millis = \"soon\"\n").unwrap();

        let err = ProjectConfig::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }
}
