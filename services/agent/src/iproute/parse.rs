//! Decoding of `ip -json` output into kernel messages.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::Deserialize;
use serde_json::Value;

use routekeeper_events::LinkAttributes;
use routekeeper_networking::{
    normalize_lladdr, protocol_from_name, table_from_name, Family, Scope, RT_TABLE_MAIN,
};

use crate::netlink::{
    AddressFamily, AddressMessage, BindingError, KernelMessage, LinkMessage, NeighbourMessage,
    NexthopMessage, RouteMessage, RouteType,
};

/// Resolves an interface name to its index.
pub type IndexLookup<'a> = &'a dyn Fn(&str) -> Option<u32>;

#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    mtu: Option<u32>,
    txqlen: Option<u32>,
    operstate: Option<String>,
    link_type: Option<String>,
    address: Option<String>,
    broadcast: Option<String>,
    master: Option<String>,
    link: Option<String>,
    linkinfo: Option<IpLinkInfo>,
    inet6_addr_gen_mode: Option<String>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    info_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpAddress {
    ifindex: u32,
    #[serde(default)]
    addr_info: Vec<IpAddressInfo>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct IpAddressInfo {
    family: String,
    local: Option<IpAddr>,
    address: Option<IpAddr>,
    prefixlen: u8,
    scope: Option<String>,
    label: Option<String>,
    protocol: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct IpRoute {
    #[serde(rename = "type")]
    route_type: Option<String>,
    dst: String,
    gateway: Option<IpAddr>,
    dev: Option<String>,
    protocol: Option<Value>,
    scope: Option<String>,
    prefsrc: Option<IpAddr>,
    table: Option<Value>,
    #[serde(default)]
    nexthops: Vec<IpNexthop>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct IpNexthop {
    gateway: Option<IpAddr>,
    dev: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpNeighbour {
    dst: IpAddr,
    dev: Option<String>,
    lladdr: Option<String>,
    #[serde(default)]
    state: Vec<String>,
    #[serde(default)]
    deleted: bool,
}

fn decode_error(e: serde_json::Error) -> BindingError {
    BindingError::Decode(e.to_string())
}

fn address_family(name: &str) -> AddressFamily {
    match name {
        "inet" => AddressFamily::Inet,
        "inet6" => AddressFamily::Inet6,
        // AF_PACKET, AF_BRIDGE and friends are irrelevant.
        _ => AddressFamily::Other(0),
    }
}

fn family_of(addr: IpAddr) -> AddressFamily {
    match Family::of(&addr) {
        Family::Inet => AddressFamily::Inet,
        Family::Inet6 => AddressFamily::Inet6,
    }
}

fn scope(name: Option<&str>) -> Scope {
    name.and_then(|s| s.parse().ok()).unwrap_or_default()
}

/// Numeric value or a name iproute2 prints for it.
fn protocol(value: Option<&Value>) -> Option<u8> {
    match value? {
        Value::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok()),
        Value::String(s) => protocol_from_name(s).ok(),
        _ => None,
    }
}

fn table(value: Option<&Value>) -> u32 {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(RT_TABLE_MAIN),
        Some(Value::String(s)) => table_from_name(s).unwrap_or(RT_TABLE_MAIN),
        _ => RT_TABLE_MAIN,
    }
}

fn route_type(name: Option<&str>) -> RouteType {
    match name {
        None | Some("unicast") => RouteType::Unicast,
        Some("local") => RouteType::Local,
        Some("broadcast") => RouteType::Broadcast,
        Some("multicast") => RouteType::Multicast,
        Some("blackhole") => RouteType::Blackhole,
        Some("unreachable") => RouteType::Unreachable,
        Some("prohibit") => RouteType::Prohibit,
        Some(_) => RouteType::Other,
    }
}

/// Split `10.0.0.0/24`, `10.0.0.1` or `default`.
fn destination(dst: &str) -> Result<(Option<IpAddr>, u8), BindingError> {
    if dst == "default" {
        return Ok((None, 0));
    }
    let (addr, len) = match dst.split_once('/') {
        Some((addr, len)) => (addr, Some(len)),
        None => (dst, None),
    };
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| BindingError::Decode(format!("invalid route destination {dst}")))?;
    let len = match len {
        Some(len) => len
            .parse()
            .map_err(|_| BindingError::Decode(format!("invalid route destination {dst}")))?,
        None => Family::of(&addr).max_prefix_len(),
    };
    Ok((Some(addr), len))
}

fn resolve(lookup: IndexLookup<'_>, dev: &str) -> Result<u32, BindingError> {
    lookup(dev).ok_or_else(|| BindingError::Decode(format!("unknown device {dev}")))
}

fn link_message(link: IpLink, lookup: IndexLookup<'_>) -> KernelMessage {
    let has = |flag: &str| link.flags.iter().any(|f| f == flag);
    let attributes = LinkAttributes {
        up: has("UP"),
        noarp: has("NOARP"),
        mtu: link.mtu,
        txqueuelen: link.txqlen,
        address: link.address.as_deref().map(normalize_lladdr),
        broadcast: link.broadcast.as_deref().map(normalize_lladdr),
        master: link.master.as_deref().and_then(lookup),
        link: link.link.as_deref().and_then(lookup),
        operstate: link.operstate,
        carrier: Some(has("LOWER_UP")),
        addrgenmode: link.inet6_addr_gen_mode,
        token: None,
        link_type: link.link_type,
    };
    let message = LinkMessage {
        ifindex: link.ifindex,
        ifname: link.ifname,
        kind: link.linkinfo.and_then(|info| info.info_kind),
        attributes,
    };
    if link.deleted {
        KernelMessage::DelLink(message)
    } else {
        KernelMessage::NewLink(message)
    }
}

fn address_messages(entry: IpAddress) -> Vec<KernelMessage> {
    entry
        .addr_info
        .into_iter()
        .map(|info| {
            let message = AddressMessage {
                family: address_family(&info.family),
                ifindex: entry.ifindex,
                prefixlen: info.prefixlen,
                local: info.local,
                address: info.address,
                scope: scope(info.scope.as_deref()),
                label: info.label,
                protocol: protocol(info.protocol.as_ref()),
            };
            if entry.deleted {
                KernelMessage::DelAddress(message)
            } else {
                KernelMessage::NewAddress(message)
            }
        })
        .collect()
}

fn route_message(
    route: IpRoute,
    family: Family,
    lookup: IndexLookup<'_>,
) -> Result<KernelMessage, BindingError> {
    let (dst, dst_len) = destination(&route.dst)?;
    let family = match (dst, route.gateway) {
        (Some(addr), _) | (None, Some(addr)) => family_of(addr),
        (None, None) => match family {
            Family::Inet => AddressFamily::Inet,
            Family::Inet6 => AddressFamily::Inet6,
        },
    };

    let mut nexthops = Vec::new();
    if route.nexthops.is_empty() {
        if route.gateway.is_some() || route.dev.is_some() {
            nexthops.push(NexthopMessage {
                gateway: route.gateway,
                oif: route.dev.as_deref().map(|d| resolve(lookup, d)).transpose()?,
            });
        }
    } else {
        for nexthop in &route.nexthops {
            nexthops.push(NexthopMessage {
                gateway: nexthop.gateway,
                oif: nexthop.dev.as_deref().map(|d| resolve(lookup, d)).transpose()?,
            });
        }
    }

    let message = RouteMessage {
        family,
        route_type: route_type(route.route_type.as_deref()),
        table: table(route.table.as_ref()),
        destination: dst,
        dst_len,
        protocol: protocol(route.protocol.as_ref()).unwrap_or(0),
        scope: scope(route.scope.as_deref()),
        prefsrc: route.prefsrc,
        nexthops,
    };
    Ok(if route.deleted {
        KernelMessage::DelRoute(message)
    } else {
        KernelMessage::NewRoute(message)
    })
}

fn neighbour_message(
    neighbour: IpNeighbour,
    lookup: IndexLookup<'_>,
) -> Result<KernelMessage, BindingError> {
    let dev = neighbour
        .dev
        .as_deref()
        .ok_or_else(|| BindingError::Decode("neighbour without device".to_string()))?;
    let message = NeighbourMessage {
        family: family_of(neighbour.dst),
        ifindex: resolve(lookup, dev)?,
        destination: Some(neighbour.dst),
        lladdr: neighbour.lladdr.as_deref().map(normalize_lladdr),
        state: neighbour.state,
    };
    Ok(if neighbour.deleted {
        KernelMessage::DelNeighbour(message)
    } else {
        KernelMessage::NewNeighbour(message)
    })
}

// =============================================================================
// Dumps
// =============================================================================

/// `ip -details -json link show`.
pub fn links(json: &[u8], lookup: IndexLookup<'_>) -> Result<Vec<KernelMessage>, BindingError> {
    let links: Vec<IpLink> = serde_json::from_slice(json).map_err(decode_error)?;

    // Masters and trunks may come later in the same dump.
    let local: HashMap<String, u32> = links.iter().map(|l| (l.ifname.clone(), l.ifindex)).collect();
    let lookup = |name: &str| local.get(name).copied().or_else(|| lookup(name));

    Ok(links.into_iter().map(|l| link_message(l, &lookup)).collect())
}

/// `ip -json address show`.
pub fn addresses(json: &[u8]) -> Result<Vec<KernelMessage>, BindingError> {
    let entries: Vec<IpAddress> = serde_json::from_slice(json).map_err(decode_error)?;
    Ok(entries.into_iter().flat_map(address_messages).collect())
}

/// `ip -json [-4|-6] route show table all`.
pub fn routes(
    json: &[u8],
    family: Family,
    lookup: IndexLookup<'_>,
) -> Result<Vec<KernelMessage>, BindingError> {
    let routes: Vec<IpRoute> = serde_json::from_slice(json).map_err(decode_error)?;
    routes
        .into_iter()
        .map(|r| route_message(r, family, lookup))
        .collect()
}

/// `ip -json neigh show`.
pub fn neighbours(json: &[u8], lookup: IndexLookup<'_>) -> Result<Vec<KernelMessage>, BindingError> {
    let entries: Vec<IpNeighbour> = serde_json::from_slice(json).map_err(decode_error)?;
    entries
        .into_iter()
        .map(|n| neighbour_message(n, lookup))
        .collect()
}

// =============================================================================
// Monitor
// =============================================================================

/// Classify one object printed by `ip -json monitor`.
///
/// The monitor does not tag objects with their class, so the class is
/// inferred from the keys each class always carries.
pub fn monitor_object(
    value: Value,
    lookup: IndexLookup<'_>,
) -> Vec<Result<KernelMessage, BindingError>> {
    let Value::Object(object) = &value else {
        if let Value::Array(items) = value {
            return items
                .into_iter()
                .flat_map(|item| monitor_object(item, lookup))
                .collect();
        }
        return vec![Err(BindingError::Decode(
            "monitor printed a non-object value".to_string(),
        ))];
    };

    if object.contains_key("addr_info") {
        return match serde_json::from_value::<IpAddress>(value) {
            Ok(entry) => address_messages(entry).into_iter().map(Ok).collect(),
            Err(e) => vec![Err(decode_error(e))],
        };
    }
    if object.contains_key("ifname") && object.contains_key("flags") {
        return vec![serde_json::from_value::<IpLink>(value)
            .map(|link| link_message(link, lookup))
            .map_err(decode_error)];
    }
    if object.contains_key("dst") && object.contains_key("state") {
        return vec![serde_json::from_value::<IpNeighbour>(value)
            .map_err(decode_error)
            .and_then(|n| neighbour_message(n, lookup))];
    }
    if object.contains_key("dst") {
        return vec![serde_json::from_value::<IpRoute>(value)
            .map_err(decode_error)
            .and_then(|r| route_message(r, Family::Inet, lookup))];
    }
    vec![Err(BindingError::Decode("unrecognised monitor object".to_string()))]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(name: &str) -> Option<u32> {
        match name {
            "lo" => Some(1),
            "eth0" => Some(2),
            "eth1" => Some(3),
            _ => None,
        }
    }

    #[test]
    fn test_links_resolve_master_within_dump() {
        let json = br#"[
            {"ifindex":2,"ifname":"eth0","flags":["BROADCAST","UP","LOWER_UP"],"mtu":1500,
             "master":"br0","link_type":"ether","address":"AA:BB:CC:DD:EE:FF","txqlen":1000},
            {"ifindex":7,"ifname":"br0","flags":["BROADCAST"],"mtu":1500,"link_type":"ether",
             "linkinfo":{"info_kind":"bridge"}}
        ]"#;
        let messages = links(json, &names).unwrap();

        let KernelMessage::NewLink(eth0) = &messages[0] else {
            panic!("expected link");
        };
        assert!(eth0.attributes.up);
        assert_eq!(eth0.attributes.master, Some(7));
        assert_eq!(eth0.attributes.carrier, Some(true));
        assert_eq!(eth0.attributes.address.as_deref(), Some("aa:bb:cc:dd:ee:ff"));

        let KernelMessage::NewLink(br0) = &messages[1] else {
            panic!("expected link");
        };
        assert_eq!(br0.kind.as_deref(), Some("bridge"));
        assert!(!br0.attributes.up);
    }

    #[test]
    fn test_addresses_one_message_per_info() {
        let json = br#"[{"ifindex":2,"ifname":"eth0","addr_info":[
            {"family":"inet","local":"10.0.0.5","prefixlen":24,"scope":"global","protocol":52},
            {"family":"inet6","local":"fe80::1","prefixlen":64,"scope":"link","protocol":"kernel_ll"}
        ]}]"#;
        let messages = addresses(json).unwrap();
        assert_eq!(messages.len(), 2);

        let KernelMessage::NewAddress(v4) = &messages[0] else {
            panic!("expected address");
        };
        assert_eq!(v4.protocol, Some(52));
        assert_eq!(v4.family, AddressFamily::Inet);

        let KernelMessage::NewAddress(v6) = &messages[1] else {
            panic!("expected address");
        };
        assert_eq!(v6.scope, Scope::Link);
        assert_eq!(v6.protocol, None);
    }

    #[test]
    fn test_routes() {
        let json = br#"[
            {"dst":"default","gateway":"192.0.2.1","dev":"eth0","protocol":"static"},
            {"dst":"10.0.0.0/24","dev":"eth1","protocol":"kernel","scope":"link","prefsrc":"10.0.0.5"},
            {"type":"local","dst":"10.0.0.5","dev":"eth1","table":"local","protocol":"kernel"},
            {"dst":"198.51.100.0/24","table":"100","protocol":"52","nexthops":[
                {"gateway":"192.0.2.1","dev":"eth0"},{"gateway":"192.0.2.2","dev":"eth1"}]}
        ]"#;
        let messages = routes(json, Family::Inet, &names).unwrap();

        let KernelMessage::NewRoute(default) = &messages[0] else {
            panic!("expected route");
        };
        assert_eq!(default.destination, None);
        assert_eq!(default.table, RT_TABLE_MAIN);
        assert_eq!(default.protocol, 4);
        assert_eq!(default.nexthops[0].oif, Some(2));

        let KernelMessage::NewRoute(local) = &messages[2] else {
            panic!("expected route");
        };
        assert_eq!(local.route_type, RouteType::Local);
        assert_eq!(local.table, 255);
        assert_eq!(local.dst_len, 32);

        let KernelMessage::NewRoute(multipath) = &messages[3] else {
            panic!("expected route");
        };
        assert_eq!(multipath.table, 100);
        assert_eq!(multipath.protocol, 52);
        assert_eq!(multipath.nexthops.len(), 2);
    }

    #[test]
    fn test_monitor_classification() {
        let link: Value =
            serde_json::from_str(r#"{"ifindex":3,"ifname":"eth1","flags":["UP"],"deleted":true}"#)
                .unwrap();
        assert!(matches!(
            monitor_object(link, &names)[0],
            Ok(KernelMessage::DelLink(_))
        ));

        let neighbour: Value = serde_json::from_str(
            r#"{"dst":"10.0.0.1","dev":"eth0","lladdr":"00:11:22:33:44:55","state":["REACHABLE"]}"#,
        )
        .unwrap();
        assert!(matches!(
            monitor_object(neighbour, &names)[0],
            Ok(KernelMessage::NewNeighbour(_))
        ));

        let route: Value =
            serde_json::from_str(r#"{"dst":"10.9.0.0/16","dev":"nosuch0"}"#).unwrap();
        assert!(monitor_object(route, &names)[0].is_err());
    }
}
