//! Local mirror of a subtree, updated by `put`/`patch` events

use serde_json::{Map, Value};

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Replace the value at `path`; null removes it
pub fn put(root: &mut Value, path: &str, data: Value) {
    set(root, &segments(path), data);
}

/// Replace each child named in `data` under `path`
pub fn patch(root: &mut Value, path: &str, data: Value) {
    let base = segments(path);
    let Value::Object(children) = data else {
        set(root, &base, data);
        return;
    };
    for (key, value) in children {
        let mut at = base.clone();
        at.push(&key);
        set(root, &at, value);
    }
}

fn set(node: &mut Value, path: &[&str], data: Value) {
    let Some((first, rest)) = path.split_first() else {
        *node = data;
        return;
    };

    if !node.is_object() {
        if data.is_null() {
            return;
        }
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else { return };

    if rest.is_empty() {
        if data.is_null() {
            map.remove(*first);
        } else {
            map.insert(first.to_string(), data);
        }
        return;
    }

    let child = map.entry(first.to_string()).or_insert(Value::Null);
    set(child, rest, data);
    if child.as_object().is_some_and(|m| m.is_empty()) || child.is_null() {
        map.remove(*first);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_at_root_replaces_everything() {
        let mut root = json!({"a": {"name": "x"}});
        put(&mut root, "/", json!({"b": {"name": "y"}}));
        assert_eq!(root, json!({"b": {"name": "y"}}));
    }

    #[test]
    fn nested_put_creates_and_removes() {
        let mut root = Value::Null;
        put(&mut root, "/esp32-A/name", json!("Kitchen"));
        assert_eq!(root, json!({"esp32-A": {"name": "Kitchen"}}));

        put(&mut root, "/esp32-A/name", Value::Null);
        assert_eq!(root, json!({}));
    }

    #[test]
    fn patch_touches_only_named_children() {
        let mut root = json!({"esp32-A": {"name": "Kitchen"}, "esp32-B": {"name": "Porch"}});
        patch(&mut root, "/esp32-A", json!({"on": true, "name": null}));
        assert_eq!(root, json!({"esp32-A": {"on": true}, "esp32-B": {"name": "Porch"}}));
    }
}
