use std::{collections::HashMap, fs, path::Path, time::Duration};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub participant_poll_interval: Duration,
    pub host_poll_interval: Duration,
    pub chat_history_capacity: usize,
    pub event_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            participant_poll_interval: Duration::from_secs(2),
            host_poll_interval: Duration::from_secs(3),
            chat_history_capacity: 500,
            event_buffer: 256,
        }
    }
}

pub fn load_settings() -> SessionSettings {
    load_settings_from(Path::new("meeting.toml"))
}

/// Defaults, then `path` if it parses, then `APP__*` environment overrides.
pub fn load_settings_from(path: &Path) -> SessionSettings {
    let mut settings = SessionSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            let values = file_cfg
                .into_iter()
                .filter_map(|(key, value)| match value {
                    toml::Value::String(v) => Some((key, v)),
                    toml::Value::Integer(v) => Some((key, v.to_string())),
                    _ => None,
                })
                .collect::<HashMap<_, _>>();
            apply_values(&mut settings, |key| values.get(key).cloned());
        }
    }

    apply_values(&mut settings, |key| {
        std::env::var(format!("APP__{}", key.to_ascii_uppercase())).ok()
    });

    settings
}

fn apply_values(settings: &mut SessionSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(ms) = lookup("participant_poll_ms").and_then(|v| parse_positive(&v)) {
        settings.participant_poll_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = lookup("host_poll_ms").and_then(|v| parse_positive(&v)) {
        settings.host_poll_interval = Duration::from_millis(ms);
    }
    if let Some(capacity) = lookup("chat_history_capacity").and_then(|v| parse_positive(&v)) {
        settings.chat_history_capacity = capacity as usize;
    }
    if let Some(buffer) = lookup("event_buffer").and_then(|v| parse_positive(&v)) {
        settings.event_buffer = buffer as usize;
    }
}

// Zero would panic `tokio::time::interval` and `broadcast::channel`.
fn parse_positive(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|v| *v > 0)
}
