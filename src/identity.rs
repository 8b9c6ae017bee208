//! Stable resource keys derived from resource attributes.
//!
//! Hosts do not hand us an identity, so history continuity across batches
//! depends on deriving the same key for the same resource every time.

use crate::types::{AttributeValue, ResourceMetrics};

/// Upper bound for fallback identities built from all attributes
pub const MAX_FALLBACK_IDENTITY_LEN: usize = 512;

pub const ATTR_HOST_NAME: &str = "host.name";
pub const ATTR_PROCESS_PID: &str = "process.pid";
pub const ATTR_DEVICE: &str = "device";
pub const ATTR_CPU: &str = "cpu";
pub const ATTR_SERVICE_INSTANCE_ID: &str = "service.instance.id";
pub const ATTR_SERVICE_NAME: &str = "service.name";
pub const ATTR_SERVICE_NAMESPACE: &str = "service.namespace";
pub const ATTR_EXECUTABLE_PATH: &str = "process.executable.path";

const DEFUNCT_STATE_KEYS: [&str; 2] = ["process.state", "process.status"];

/// Derive the identity key for a resource.
///
/// Specialized kinds win over generic service identity, which wins over the
/// sorted-attribute fallback.
pub fn resource_identity(resource: &ResourceMetrics) -> String {
    specialized_identity(resource)
        .or_else(|| service_identity(resource))
        .unwrap_or_else(|| fallback_identity(resource))
}

fn specialized_identity(resource: &ResourceMetrics) -> Option<String> {
    let host = resource.attr_str(ATTR_HOST_NAME);
    let scoped = |kind: &str, key: String| match &host {
        Some(h) => format!("{}:{}:{}", kind, h, key),
        None => format!("{}:{}", kind, key),
    };

    if let Some(pid) = resource.attr_str(ATTR_PROCESS_PID) {
        return Some(scoped("process", pid));
    }
    if let Some(device) = resource.attr_str(ATTR_DEVICE) {
        return Some(scoped("device", device));
    }
    if let Some(core) = resource.attr_str(ATTR_CPU) {
        return Some(scoped("cpu", core));
    }
    None
}

fn service_identity(resource: &ResourceMetrics) -> Option<String> {
    if let Some(id) = resource.attr_str(ATTR_SERVICE_INSTANCE_ID) {
        return Some(format!("service:{}", id));
    }
    let name = resource.attr_str(ATTR_SERVICE_NAME)?;
    Some(match resource.attr_str(ATTR_SERVICE_NAMESPACE) {
        Some(ns) => format!("service:{}/{}", ns, name),
        None => format!("service:{}", name),
    })
}

fn fallback_identity(resource: &ResourceMetrics) -> String {
    // Attributes are a BTreeMap, so iteration is already sorted by key
    let pairs: Vec<String> = resource
        .attributes
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    let mut id = format!("attrs:{}", pairs.join(","));
    truncate_on_char_boundary(&mut id, MAX_FALLBACK_IDENTITY_LEN);
    id
}

fn truncate_on_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Full executable path, used for include-list matching
pub fn executable_path(resource: &ResourceMetrics) -> Option<String> {
    resource.attr_str(ATTR_EXECUTABLE_PATH)
}

/// Whether the source reported this resource as a defunct process
pub fn is_defunct(resource: &ResourceMetrics) -> bool {
    DEFUNCT_STATE_KEYS.iter().any(|key| {
        matches!(
            resource.attributes.get(*key),
            Some(AttributeValue::String(s))
                if s.eq_ignore_ascii_case("z")
                    || s.eq_ignore_ascii_case("zombie")
                    || s.eq_ignore_ascii_case("defunct")
        )
    })
}
