//! Store path conventions.
//!
//! ```text
//! /local/domain                               domain list
//! <domain path>/device/<class>                device list for one domain
//! <domain path>/device/<class>/<dev>          one frontend device
//! <domain path>/device/<class>/<dev>/state    frontend connection state
//! ```

use super::ids::DeviceId;

/// Default root whose children are the live domain ids.
pub const DOMAIN_LIST_PATH: &str = "/local/domain";
/// Default name of the per-domain directory holding frontend devices.
pub const DEVICE_DIR: &str = "device";
/// Relative node holding the id of the domain the caller runs in.
pub const OWN_DOMAIN_ID_NODE: &str = "domid";
/// Node name of a connection state inside a device directory.
pub const STATE_NODE: &str = "state";
/// Node naming the backend domain that should serve a frontend device.
pub const BACKEND_ID_NODE: &str = "backend-id";

/// Joins `child` onto `parent` with exactly one separating slash.
pub fn join(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    if parent.is_empty() {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// `<domain path>/<device dir>/<class>`
pub fn device_list_path(domain_path: &str, device_dir: &str, device_class: &str) -> String {
    join(&join(domain_path, device_dir), device_class)
}

/// `<device list path>/<dev>`
pub fn device_path(device_list_path: &str, device: DeviceId) -> String {
    join(device_list_path, &device.to_string())
}

/// `<device path>/state`
pub fn state_path(device_path: &str) -> String {
    join(device_path, STATE_NODE)
}

/// `<device path>/backend-id`
pub fn backend_id_path(device_path: &str) -> String {
    join(device_path, BACKEND_ID_NODE)
}

/// Returns `true` if `path` equals `root` or lies beneath it.
pub fn is_within(path: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return path.starts_with('/');
    }
    path == root || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_normalises_slashes() {
        assert_eq!(join("/local/domain/", "/3"), "/local/domain/3");
        assert_eq!(join("/local/domain", "3"), "/local/domain/3");
        assert_eq!(join("", "local"), "/local");
    }

    #[test]
    fn test_frontend_paths_follow_device_layout() {
        let list = device_list_path("/local/domain/3", DEVICE_DIR, "vif");
        assert_eq!(list, "/local/domain/3/device/vif");

        let dev = device_path(&list, DeviceId(0));
        assert_eq!(dev, "/local/domain/3/device/vif/0");
        assert_eq!(state_path(&dev), "/local/domain/3/device/vif/0/state");
        assert_eq!(backend_id_path(&dev), "/local/domain/3/device/vif/0/backend-id");
    }

    #[test]
    fn test_is_within_respects_component_boundaries() {
        assert!(is_within("/local/domain/3", "/local/domain"));
        assert!(is_within("/local/domain", "/local/domain"));
        assert!(!is_within("/local/domainx", "/local/domain"));
        assert!(!is_within("/local", "/local/domain"));
    }
}
