//! iproute2 command lines for kernel commands.

use std::net::IpAddr;

use routekeeper_networking::Family;

use crate::kernel::{AddressSpec, KernelError, LinkKindSpec, LinkParams, LinkSpec, RouteSpec};

/// Resolves an interface index to its current name.
pub type NameLookup<'a> = &'a dyn Fn(u32) -> Option<String>;

fn name_of(lookup: NameLookup<'_>, ifindex: u32) -> Result<String, KernelError> {
    lookup(ifindex).ok_or(KernelError::NoDevice)
}

fn family_flag(family: Family) -> &'static str {
    match family {
        Family::Inet => "-4",
        Family::Inet6 => "-6",
    }
}

fn push<T: ToString>(args: &mut Vec<String>, key: &str, value: Option<T>) {
    if let Some(value) = value {
        args.push(key.to_string());
        args.push(value.to_string());
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

pub fn link_add(link: &LinkSpec, lookup: NameLookup<'_>) -> Result<Vec<String>, KernelError> {
    let mut args = vec!["link".to_string(), "add".to_string()];

    if let LinkKindSpec::Vlan { trunk, .. } = &link.kind {
        push(&mut args, "link", Some(name_of(lookup, *trunk)?));
    }
    args.extend(["name".to_string(), link.name.clone()]);
    args.extend(["type".to_string(), link.kind.kind().to_string()]);

    match &link.kind {
        LinkKindSpec::Bridge { stp } => {
            push(&mut args, "stp_state", Some(u8::from(*stp)));
        }
        LinkKindSpec::Vlan { id, .. } => {
            push(&mut args, "id", Some(id));
        }
        LinkKindSpec::Vxlan {
            vni,
            underlay,
            local,
            remote,
            group,
            port,
            ttl,
        } => {
            push(&mut args, "id", Some(vni));
            if let Some(underlay) = underlay {
                push(&mut args, "dev", Some(name_of(lookup, *underlay)?));
            }
            push(&mut args, "local", *local);
            push(&mut args, "remote", *remote);
            push(&mut args, "group", *group);
            push(&mut args, "dstport", *port);
            push(&mut args, "ttl", *ttl);
        }
        LinkKindSpec::Sit { local, remote, ttl } => {
            push(&mut args, "local", *local);
            push(&mut args, "remote", *remote);
            push(&mut args, "ttl", *ttl);
        }
    }
    Ok(args)
}

/// `ip link set` plus, when a token is given, `ip token set`.
pub fn link_set(
    ifindex: u32,
    params: &LinkParams,
    lookup: NameLookup<'_>,
) -> Result<Vec<Vec<String>>, KernelError> {
    let name = name_of(lookup, ifindex)?;
    let mut commands = Vec::new();

    let mut args = vec![
        "link".to_string(),
        "set".to_string(),
        "dev".to_string(),
        name.clone(),
    ];
    let base = args.len();

    if let Some(up) = params.up {
        args.push(if up { "up" } else { "down" }.to_string());
    }
    push(&mut args, "arp", params.noarp.map(|noarp| on_off(!noarp)));
    push(&mut args, "mtu", params.mtu);
    push(&mut args, "txqueuelen", params.txqueuelen);
    push(&mut args, "address", params.address.as_ref());
    push(&mut args, "broadcast", params.broadcast.as_ref());
    match params.master {
        Some(0) => args.push("nomaster".to_string()),
        Some(master) => push(&mut args, "master", Some(name_of(lookup, master)?)),
        None => {}
    }
    push(&mut args, "addrgenmode", params.addrgenmode.as_ref());

    if args.len() > base {
        commands.push(args);
    }

    if let Some(token) = &params.token {
        commands.push(vec![
            "token".to_string(),
            "set".to_string(),
            token.clone(),
            "dev".to_string(),
            name,
        ]);
    }
    Ok(commands)
}

pub fn link_delete(ifindex: u32, lookup: NameLookup<'_>) -> Result<Vec<String>, KernelError> {
    Ok(vec![
        "link".to_string(),
        "del".to_string(),
        "dev".to_string(),
        name_of(lookup, ifindex)?,
    ])
}

pub fn address_add(address: &AddressSpec, lookup: NameLookup<'_>) -> Result<Vec<String>, KernelError> {
    let mut args = vec![
        family_flag(address.address.family()).to_string(),
        "address".to_string(),
        "add".to_string(),
    ];
    match address.peer {
        Some(peer) => {
            args.push(address.address.addr().to_string());
            args.push("peer".to_string());
            args.push(format!("{peer}/{}", address.address.prefix_len()));
        }
        None => args.push(address.address.to_string()),
    }
    args.extend(["dev".to_string(), name_of(lookup, address.ifindex)?]);
    push(&mut args, "proto", Some(address.protocol));
    if address.noprefixroute {
        args.push("noprefixroute".to_string());
    }
    Ok(args)
}

pub fn address_remove(
    address: &AddressSpec,
    lookup: NameLookup<'_>,
) -> Result<Vec<String>, KernelError> {
    let mut args = vec![
        family_flag(address.address.family()).to_string(),
        "address".to_string(),
        "del".to_string(),
    ];
    match address.peer {
        Some(peer) => {
            args.push(address.address.addr().to_string());
            args.push("peer".to_string());
            args.push(format!("{peer}/{}", address.address.prefix_len()));
        }
        None => args.push(address.address.to_string()),
    }
    args.extend(["dev".to_string(), name_of(lookup, address.ifindex)?]);
    Ok(args)
}

pub fn address_flush(
    ifindex: u32,
    protocol: u8,
    lookup: NameLookup<'_>,
) -> Result<Vec<String>, KernelError> {
    Ok(vec![
        "address".to_string(),
        "flush".to_string(),
        "dev".to_string(),
        name_of(lookup, ifindex)?,
        "proto".to_string(),
        protocol.to_string(),
    ])
}

fn nexthop_args(
    args: &mut Vec<String>,
    gateway: Option<IpAddr>,
    ifindex: Option<u32>,
    lookup: NameLookup<'_>,
) -> Result<(), KernelError> {
    push(args, "via", gateway);
    if let Some(ifindex) = ifindex {
        push(args, "dev", Some(name_of(lookup, ifindex)?));
    }
    Ok(())
}

pub fn route_replace(route: &RouteSpec, lookup: NameLookup<'_>) -> Result<Vec<String>, KernelError> {
    let mut args = vec![
        family_flag(route.destination.family()).to_string(),
        "route".to_string(),
        "replace".to_string(),
        route.destination.to_string(),
    ];
    push(&mut args, "table", Some(route.table));
    push(&mut args, "proto", Some(route.protocol));
    push(&mut args, "scope", route.scope.map(|s| s.as_str()));
    push(&mut args, "src", route.prefsrc);

    if route.is_multipath() {
        for nexthop in &route.nexthops {
            args.push("nexthop".to_string());
            nexthop_args(&mut args, nexthop.gateway, nexthop.ifindex, lookup)?;
        }
    } else if let Some(nexthop) = route.nexthops.first() {
        nexthop_args(&mut args, nexthop.gateway, nexthop.ifindex, lookup)?;
    }
    Ok(args)
}

pub fn route_delete(route: &RouteSpec) -> Vec<String> {
    vec![
        family_flag(route.destination.family()).to_string(),
        "route".to_string(),
        "del".to_string(),
        route.destination.to_string(),
        "table".to_string(),
        route.table.to_string(),
        "proto".to_string(),
        route.protocol.to_string(),
    ]
}
