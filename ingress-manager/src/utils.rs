use std::collections::HashSet;

pub(crate) fn metric_name(name: &str) -> String {
    format!("ingress_manager_{}", name)
}

/// Whether `namespace` is selected by an optional namespace filter, `None` selects all.
pub(crate) fn is_watched(watch_namespaces: Option<&HashSet<String>>, namespace: &str) -> bool {
    watch_namespaces.map_or(true, |v| {
        v.is_empty() || v.contains(namespace) || v.contains("*")
    })
}
