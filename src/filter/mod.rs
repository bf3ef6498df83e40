use tracing::trace;

use crate::types::{is_ipv4, parse_cidr, HostLocalIpam, RangeGroup};

/// Whether a pod in `namespace` may get an IPv4 address. Without an
/// allow-list every namespace may. With one, an unknown (empty)
/// namespace is denied.
pub fn ipv4_permitted(namespace: &str, allow_list: Option<&[String]>) -> bool {
    match allow_list {
        None => true,
        Some(list) => !namespace.is_empty() && list.iter().any(|ns| ns == namespace),
    }
}

/// Compute the ranges handed to host-local. When IPv4 is not permitted
/// only the first non-IPv4 range is kept.
pub fn apply(resolved: &HostLocalIpam, namespace: &str, allow_list: Option<&[String]>) -> HostLocalIpam {
    let assign_ipv4 = ipv4_permitted(namespace, allow_list);
    trace!(namespace, ?allow_list, assign_ipv4, "Address family filter");
    if assign_ipv4 {
        return resolved.clone();
    }

    let ranges: Vec<RangeGroup> = resolved
        .ranges
        .iter()
        .find(|group| !group_is_ipv4(group))
        .cloned()
        .into_iter()
        .collect();

    HostLocalIpam {
        ranges,
        ..resolved.clone()
    }
}

fn group_is_ipv4(group: &RangeGroup) -> bool {
    group
        .first()
        .and_then(|item| parse_cidr(&item.subnet).ok())
        .is_some_and(|net| is_ipv4(net.ip()))
}
