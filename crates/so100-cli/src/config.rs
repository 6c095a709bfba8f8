//! Demo configuration – `~/.so100/config.toml`, then `SO100_*` environment
//! overrides, then command-line flags (applied in `main`).

use serde::{Deserialize, Serialize};
use so100_runtime::{ChatConfig, SearchUnavailable};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted demo configuration. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial device of the servo bus.
    pub robot_port: String,
    pub baud_rate: u32,
    /// `N` in `/dev/videoN`.
    pub camera_index: u32,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Streaming rate of the `frame` loop.
    pub demo_fps: u32,
    /// Run against the synthetic robot instead of hardware.
    pub use_mock: bool,
    /// Image the mock robot shows instead of its synthetic scene.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mock_static_image: Option<PathBuf>,
    pub io_timeout_ms: u64,

    /// Policy locations; an `http(s)://` URL serves a remote policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grasp_policy: Option<String>,
    pub policy_timeout_ms: u64,
    pub search_max_steps: usize,
    pub grasp_max_steps: usize,
    pub search_step_hz: f64,
    pub grasp_step_hz: f64,
    pub on_search_unavailable: SearchUnavailable,

    /// HTTP/WebSocket port of the cockpit.
    pub cockpit_port: u16,

    pub llm: ChatConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            robot_port: "/dev/ttyUSB0".to_string(),
            baud_rate: 1_000_000,
            camera_index: 0,
            camera_width: 640,
            camera_height: 480,
            demo_fps: 15,
            use_mock: false,
            mock_static_image: None,
            io_timeout_ms: 500,
            search_policy: None,
            grasp_policy: None,
            policy_timeout_ms: 2_000,
            search_max_steps: 50,
            grasp_max_steps: 100,
            search_step_hz: 5.0,
            grasp_step_hz: 10.0,
            on_search_unavailable: SearchUnavailable::PassThrough,
            cockpit_port: 8000,
            llm: ChatConfig::default(),
        }
    }
}

/// Return the path to `~/.so100/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".so100").join("config.toml")
}

/// Load `path` (defaults when the file is absent) and apply the process
/// environment on top.
pub fn load(path: &Path) -> Result<Config, String> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Parse the file at `path`. Returns `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply environment overrides from the current process.
///
/// | Variable | Config field |
/// |---|---|
/// | `SO100_PORT` | `robot_port` |
/// | `SO100_BAUD_RATE` | `baud_rate` |
/// | `SO100_CAMERA_INDEX` | `camera_index` |
/// | `SO100_DEMO_FPS` | `demo_fps` |
/// | `USE_MOCK_ROBOT` | `use_mock` (`1`, `true`, `yes`) |
/// | `MOCK_STATIC_IMAGE_PATH` | `mock_static_image` |
/// | `SO100_SEARCH_POLICY` / `SO100_GRASP_POLICY` | `search_policy` / `grasp_policy` |
/// | `SO100_DEMO_PORT` | `cockpit_port` |
/// | `LLM_PROVIDER`, `LLM_MODEL`, `LLM_BASE_URL`, `LLM_API_KEY_ENV` | `llm.*` |
/// | `LLM_TIMEOUT_MS` | `llm.timeout_ms` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides_from(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("SO100_PORT") {
        cfg.robot_port = v;
    }
    if let Some(v) = var("SO100_BAUD_RATE").and_then(|v| v.parse().ok()) {
        cfg.baud_rate = v;
    }
    if let Some(v) = var("SO100_CAMERA_INDEX").and_then(|v| v.parse().ok()) {
        cfg.camera_index = v;
    }
    if let Some(v) = var("SO100_DEMO_FPS").and_then(|v| v.parse().ok()) {
        cfg.demo_fps = v;
    }
    if let Some(v) = var("USE_MOCK_ROBOT") {
        cfg.use_mock = is_truthy(&v);
    }
    if let Some(v) = var("MOCK_STATIC_IMAGE_PATH").filter(|v| !v.trim().is_empty()) {
        cfg.mock_static_image = Some(PathBuf::from(v));
    }
    if let Some(v) = var("SO100_SEARCH_POLICY") {
        cfg.search_policy = Some(v);
    }
    if let Some(v) = var("SO100_GRASP_POLICY") {
        cfg.grasp_policy = Some(v);
    }
    if let Some(v) = var("SO100_DEMO_PORT").and_then(|v| v.parse().ok()) {
        cfg.cockpit_port = v;
    }
    if let Some(v) = var("LLM_PROVIDER") {
        cfg.llm.provider = v;
    }
    if let Some(v) = var("LLM_MODEL") {
        cfg.llm.model = v;
    }
    if let Some(v) = var("LLM_BASE_URL") {
        cfg.llm.base_url = v;
    }
    if let Some(v) = var("LLM_API_KEY_ENV") {
        cfg.llm.api_key_env = Some(v);
    }
    if let Some(v) = var("LLM_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        cfg.llm.timeout_ms = v;
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

/// Write `cfg` to `path`, creating the parent directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}
