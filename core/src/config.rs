//! Global config singleton. Load settings.json once; the server and tests
//! both call `ensure_loaded()` so the first caller does the work, later
//! callers get the same instance. Every knob has a working default, so a
//! missing or partial settings.json is fine.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Cached config from settings.json.
pub struct Config {
    /// Default working directory for new sessions (overridden by `parent`).
    pub working_dir: PathBuf,
    /// Directory holding the recording triples.
    pub recordings_dir: PathBuf,
    /// Message shown to the first client before the subprocess speaks.
    pub motd: Option<String>,
    /// Startup window during which client input is buffered, not forwarded.
    pub input_grace: Duration,
    /// Scrollback ring capacity in bytes.
    pub scrollback_bytes: usize,
    /// Reaper: newest recordings kept per agent.
    pub keep_per_agent: usize,
    /// Reaper: recordings older than this are deleted regardless of count.
    pub recording_max_age: Duration,
}

/// Ensure config is loaded (idempotent). Reads ./settings.json on first call.
pub fn ensure_loaded() -> &'static Config {
    CONFIG.get_or_init(|| load_settings_from(&PathBuf::from("settings.json")))
}

fn load_settings_from(path: &std::path::Path) -> Config {
    let Ok(data) = std::fs::read_to_string(path) else {
        return Config::default();
    };
    let Ok(root) = serde_json::from_str::<serde_json::Value>(&data) else {
        return Config::default();
    };

    let defaults = Config::default();

    let working_dir = root
        .get("working_dir")
        .and_then(|v| v.as_str())
        .map(|s| PathBuf::from(s.trim()))
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(defaults.working_dir);

    let recordings_dir = root
        .get("recordings_dir")
        .and_then(|v| v.as_str())
        .map(|s| PathBuf::from(s.trim()))
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| working_dir.join("recordings"));

    let motd = root
        .get("motd")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty());

    let input_grace = root
        .get("input_grace_ms")
        .and_then(|v| v.as_u64())
        .map(Duration::from_millis)
        .unwrap_or(defaults.input_grace);

    let scrollback_bytes = root
        .get("scrollback_bytes")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .filter(|n| *n > 0)
        .unwrap_or(defaults.scrollback_bytes);

    let keep_per_agent = root
        .get("keep_per_agent")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .unwrap_or(defaults.keep_per_agent);

    let recording_max_age = root
        .get("recording_max_age_secs")
        .and_then(|v| v.as_u64())
        .map(Duration::from_secs)
        .unwrap_or(defaults.recording_max_age);

    Config {
        working_dir,
        recordings_dir,
        motd,
        input_grace,
        scrollback_bytes,
        keep_per_agent,
        recording_max_age,
    }
}

/// Default working directory: ~/termweave.
fn default_working_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join("termweave")
}

impl Default for Config {
    fn default() -> Self {
        let working_dir = default_working_dir();
        let recordings_dir = working_dir.join("recordings");
        Self {
            working_dir,
            recordings_dir,
            motd: None,
            input_grace: Duration::from_secs(3),
            scrollback_bytes: 512 * 1024,
            keep_per_agent: 5,
            recording_max_age: Duration::from_secs(3600),
        }
    }
}
