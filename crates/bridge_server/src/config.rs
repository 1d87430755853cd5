use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use bridge_core::{BridgeOptions, ConnectionSettings};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const CONFIG_FILE: &str = "bridge.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub bind_addr: String,
    pub connection: ConnectionSettings,
    pub poll_interval_ms: u64,
    pub throttle_window_ms: u64,
    pub config_reload_interval_ms: u64,
    pub simulate_terminal: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let options = BridgeOptions::default();
        Self {
            bind_addr: "127.0.0.1:8765".into(),
            connection: ConnectionSettings::default(),
            poll_interval_ms: options.poll_interval.as_millis() as u64,
            throttle_window_ms: options.throttle_window.as_millis() as u64,
            config_reload_interval_ms: 5_000,
            simulate_terminal: false,
        }
    }
}

impl Settings {
    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            throttle_window: Duration::from_millis(self.throttle_window_ms),
        }
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_millis(self.config_reload_interval_ms.max(100))
    }
}

/// Every key is optional; absent keys keep their current value.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    enabled: Option<bool>,
    remote: Option<bool>,
    remote_address: Option<String>,
    bind_addr: Option<String>,
    poll_interval_ms: Option<u64>,
    throttle_window_ms: Option<u64>,
    config_reload_interval_ms: Option<u64>,
    simulate_terminal: Option<bool>,
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(CONFIG_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();
    match read_file_config(path) {
        Ok(Some(file_cfg)) => apply_file(&mut settings, file_cfg),
        Ok(None) => debug!(path = %path.display(), "config: no file, using defaults"),
        Err(err) => warn!(path = %path.display(), error = %format!("{err:#}"), "config: ignoring unreadable file"),
    }
    apply_env(&mut settings, env);
    settings
}

fn read_file_config(path: &Path) -> anyhow::Result<Option<FileConfig>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };
    let parsed = toml::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(parsed))
}

fn apply_file(settings: &mut Settings, file_cfg: FileConfig) {
    if let Some(v) = file_cfg.enabled {
        settings.connection.enabled = v;
    }
    if let Some(v) = file_cfg.remote {
        settings.connection.remote = v;
    }
    if let Some(v) = file_cfg.remote_address {
        settings.connection.remote_address = v;
    }
    if let Some(v) = file_cfg.bind_addr {
        settings.bind_addr = v;
    }
    if let Some(v) = file_cfg.poll_interval_ms {
        settings.poll_interval_ms = v;
    }
    if let Some(v) = file_cfg.throttle_window_ms {
        settings.throttle_window_ms = v;
    }
    if let Some(v) = file_cfg.config_reload_interval_ms {
        settings.config_reload_interval_ms = v;
    }
    if let Some(v) = file_cfg.simulate_terminal {
        settings.simulate_terminal = v;
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn apply_env(settings: &mut Settings, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = env("BRIDGE_ENABLED").as_deref().and_then(parse_flag) {
        settings.connection.enabled = v;
    }
    if let Some(v) = env("BRIDGE_REMOTE").as_deref().and_then(parse_flag) {
        settings.connection.remote = v;
    }
    if let Some(v) = env("BRIDGE_REMOTE_ADDRESS") {
        settings.connection.remote_address = v;
    }

    if let Some(v) = env("BRIDGE_BIND_ADDR") {
        settings.bind_addr = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.bind_addr = v;
    }

    if let Some(v) = env("BRIDGE_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        settings.poll_interval_ms = v;
    }
    if let Some(v) = env("BRIDGE_THROTTLE_WINDOW_MS").and_then(|v| v.parse().ok()) {
        settings.throttle_window_ms = v;
    }
    if let Some(v) = env("BRIDGE_CONFIG_RELOAD_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        settings.config_reload_interval_ms = v;
    }
    if let Some(v) = env("BRIDGE_SIMULATE_TERMINAL").as_deref().and_then(parse_flag) {
        settings.simulate_terminal = v;
    }
}

/// Re-reads `path` every `interval` and publishes connection-setting
/// changes. Stops once every receiver is gone.
pub fn spawn_reload(
    path: PathBuf,
    interval: Duration,
    initial: ConnectionSettings,
) -> watch::Receiver<ConnectionSettings> {
    let (updates, receiver) = watch::channel(initial);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = updates.closed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let connection = load_settings_from(&path, |key| std::env::var(key).ok()).connection;
            let changed = updates.send_if_modified(|current| {
                if *current == connection {
                    return false;
                }
                *current = connection.clone();
                true
            });
            if changed {
                info!(
                    enabled = connection.enabled,
                    remote = connection.remote,
                    "config: connection settings changed on disk"
                );
            }
        }
        debug!("config: reload task stopped");
    });
    receiver
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        env, fs,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    fn temp_config(test: &str, contents: &str) -> PathBuf {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = env::temp_dir().join(format!("bridge_config_{test}_{suffix}"));
        fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, contents).expect("write config");
        path
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn missing_file_yields_defaults() {
        let settings = load_settings_from(Path::new("/nonexistent/bridge.toml"), no_env);
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.bridge_options(), BridgeOptions::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let path = temp_config(
            "file_values",
            r#"
enabled = false
remote = true
remote_address = "10.0.0.7"
poll_interval_ms = 500
simulate_terminal = true
"#,
        );
        let settings = load_settings_from(&path, no_env);
        assert!(!settings.connection.enabled);
        assert_eq!(
            settings.connection.mode(),
            shared::domain::ConnectionMode::Remote("10.0.0.7".into())
        );
        assert_eq!(settings.bridge_options().poll_interval, Duration::from_millis(500));
        assert!(settings.simulate_terminal);
        fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
    }

    #[test]
    fn malformed_file_is_ignored() {
        let path = temp_config("malformed", "enabled = \"maybe\"\n");
        assert_eq!(load_settings_from(&path, no_env), Settings::default());
        fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
    }

    #[test]
    fn env_overrides_file() {
        let path = temp_config("env", "bind_addr = \"0.0.0.0:9000\"\nremote = false\n");
        let vars: HashMap<&str, &str> = HashMap::from([
            ("APP__BIND_ADDR", "127.0.0.1:9100"),
            ("BRIDGE_REMOTE", "yes"),
            ("BRIDGE_REMOTE_ADDRESS", "terminal-host"),
            ("BRIDGE_THROTTLE_WINDOW_MS", "not-a-number"),
        ]);
        let settings = load_settings_from(&path, |key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(settings.bind_addr, "127.0.0.1:9100");
        assert!(settings.connection.remote);
        assert_eq!(settings.connection.remote_address, "terminal-host");
        assert_eq!(settings.throttle_window_ms, Settings::default().throttle_window_ms);
        fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
    }

    #[test]
    fn flags_accept_common_spellings() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" off "), Some(false));
        assert_eq!(parse_flag("2"), None);
    }

    #[tokio::test]
    async fn reload_publishes_changed_connection_settings() {
        let path = temp_config("reload", "enabled = true\n");
        let mut updates = spawn_reload(
            path.clone(),
            Duration::from_millis(20),
            ConnectionSettings::default(),
        );

        fs::write(&path, "enabled = true\nremote = true\nremote_address = \"host-b\"\n")
            .expect("rewrite config");
        tokio::time::timeout(Duration::from_secs(5), updates.changed())
            .await
            .expect("reload in time")
            .expect("sender alive");
        assert_eq!(
            updates.borrow().mode(),
            shared::domain::ConnectionMode::Remote("host-b".into())
        );
        fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
    }
}
