//! Registry path layout
//!
//! ```text
//! users/<owner>/devices/<deviceId> -> { attribute: value, ... }
//! ```

/// Children of this path are the owner's devices
pub fn devices_path(owner: &str) -> String {
    format!("users/{owner}/devices")
}

pub fn device_path(owner: &str, device_id: &str) -> String {
    format!("users/{owner}/devices/{device_id}")
}

/// Keys may not be empty or contain characters the hierarchical store
/// reserves for paths and queries.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 768
        && !key
            .chars()
            .any(|c| matches!(c, '.' | '$' | '#' | '[' | ']' | '/') || c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_nest_devices_under_owner() {
        assert_eq!(devices_path("user-1"), "users/user-1/devices");
        assert_eq!(device_path("user-1", "esp32-9F3A"), "users/user-1/devices/esp32-9F3A");
    }

    #[test]
    fn reserved_characters_are_rejected() {
        assert!(is_valid_key("esp32-9F3A"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("a/b"));
        assert!(!is_valid_key("a.b"));
        assert!(!is_valid_key("a#b"));
    }
}
