use std::sync::LazyLock;

use regex::Regex;

/// Group identifier returned when no EMR cluster id can be derived.
pub const UNKNOWN_GROUP_ID: &str = "unknown";

/// Substring marking a tracking URL as served from AWS.
const CLOUD_MARKER: &str = "amazonaws.com";

/// EMR cluster id anywhere in a string.
static CLUSTER_ID_SEARCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"j-[A-Z0-9]{13}").expect("cluster id pattern is valid")
});

/// EMR cluster id spanning a whole path segment.
static CLUSTER_ID_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^j-[A-Z0-9]{13}$").expect("cluster id pattern is valid")
});

/// Derive the cluster (group) id a Spark application belongs to.
///
/// Lookup order:
/// 1. a tracking URL on an AWS host with a path segment shaped like an EMR
///    cluster id (`j-` followed by 13 of `[A-Z0-9]`),
/// 2. the first cluster id embedded anywhere in the application name,
/// 3. [`UNKNOWN_GROUP_ID`].
///
/// Total and deterministic: every input, including empty and malformed
/// strings, maps to exactly one id.
pub fn extract_group_id(name: &str, tracking_url: &str) -> String {
    if let Some(id) = from_tracking_url(tracking_url) {
        return id.to_string();
    }

    if let Some(m) = CLUSTER_ID_SEARCH.find(name) {
        return m.as_str().to_string();
    }

    UNKNOWN_GROUP_ID.to_string()
}

fn from_tracking_url(tracking_url: &str) -> Option<&str> {
    if !tracking_url.contains(CLOUD_MARKER) {
        return None;
    }

    tracking_url
        .split(['/', '?', '#'])
        .find(|segment| CLUSTER_ID_SEGMENT.is_match(segment))
}
