//! Layering of config documents.

use toml::Value;

/// Lay `layer` over `base` and return how many leaf values it set.
///
/// Tables combine key by key. Any other value in `layer`, arrays included,
/// takes the place of whatever `base` held at that key.
pub fn overlay(base: &mut Value, layer: &Value) -> usize {
    let (Value::Table(into), Value::Table(from)) = (&mut *base, layer) else {
        *base = layer.clone();
        return 1;
    };
    let mut set = 0usize;
    for (key, value) in from {
        let count = match into.get_mut(key) {
            Some(existing) => overlay(existing, value),
            None => {
                into.insert(key.clone(), value.clone());
                leaf_count(value)
            },
        };
        set = set.saturating_add(count);
    }
    set
}

fn leaf_count(value: &Value) -> usize {
    match value {
        Value::Table(table) => table
            .values()
            .map(leaf_count)
            .fold(0, usize::saturating_add),
        _ => 1,
    }
}
