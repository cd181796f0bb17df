//! Topic templates and MQTT filter matching

/// Filter the coordinator subscribes to for every robot's accepted shadow updates
pub const SHADOW_UPDATE_ACCEPTED_ALL: &str = "$shadow/things/+/update/accepted";

/// Topic a robot publishes its shadow update requests to
pub fn shadow_update(thing_name: &str) -> String {
    format!("$shadow/things/{}/update", thing_name)
}

/// Topic the shadow service republishes accepted updates on
pub fn shadow_update_accepted(thing_name: &str) -> String {
    format!("$shadow/things/{}/update/accepted", thing_name)
}

/// Topic orders for one robot are published to
pub fn process_order(thing_name: &str) -> String {
    format!("robots/{}/process_order", thing_name)
}

/// Extract the thing name from a `$shadow/things/{thing}/update[...]` topic
pub fn thing_from_shadow_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("$shadow"), Some("things"), Some(thing), Some("update")) if !thing.is_empty() => {
            Some(thing)
        }
        _ => None,
    }
}

/// Check whether `topic` matches the subscription `filter`
///
/// `+` matches exactly one level, a trailing `#` matches the parent level and
/// everything below it. Wildcards never match topics starting with `$` at the
/// first level.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
