use std::collections::HashMap;

/// Prefix of every recognized environment variable.
pub const ENV_PREFIX: &str = "PLUGHOST_";

/// Environment variables and the config field each one sets.
///
/// `PLUGHOST_PLUGIN_DIRS` and `PLUGHOST_WATCH_PATHS` are `:`-separated lists.
pub const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("PLUGHOST_PLUGIN_DIRS", "runtime.plugin_dirs"),
    ("PLUGHOST_STATE_DIR", "runtime.state_dir"),
    ("PLUGHOST_TRUST_DIR", "runtime.trust_dir"),
    ("PLUGHOST_WATCH_PATHS", "devices.watch_paths"),
    ("PLUGHOST_LOG_LEVEL", "logging.level"),
    ("PLUGHOST_LOG_FORMAT", "logging.format"),
    ("PLUGHOST_JOB_STORE", "dispatcher.store"),
];

/// Snapshot the `PLUGHOST_*` variables of the current process.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with(ENV_PREFIX))
        .collect()
}

/// Apply environment overrides to a merged TOML tree. Returns how many were
/// applied.
pub fn apply_env_overrides(merged: &mut toml::Value, env: &HashMap<String, String>) -> usize {
    let mut applied = 0usize;
    for (var, field) in ENV_OVERRIDES {
        let Some(raw) = env.get(*var) else { continue };
        let value = if var.ends_with("_DIRS") || var.ends_with("_PATHS") {
            toml::Value::Array(
                raw.split(':')
                    .filter(|s| !s.is_empty())
                    .map(|s| toml::Value::String(s.to_owned()))
                    .collect(),
            )
        } else {
            toml::Value::String(raw.clone())
        };
        if set_path(merged, field, value) {
            tracing::debug!(var, field, "applied environment override");
            applied = applied.saturating_add(1);
        }
    }
    applied
}

fn set_path(root: &mut toml::Value, dotted: &str, value: toml::Value) -> bool {
    let mut segments: Vec<&str> = dotted.split('.').collect();
    let Some(leaf) = segments.pop() else {
        return false;
    };
    let mut node = root;
    for segment in segments {
        let Some(table) = node.as_table_mut() else {
            return false;
        };
        node = table
            .entry(segment.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
    match node.as_table_mut() {
        Some(table) => {
            table.insert(leaf.to_owned(), value);
            true
        },
        None => false,
    }
}
