//! Translation of rtnetlink messages into events.

use std::collections::{HashMap, VecDeque};
use std::sync::PoisonError;

use tracing::debug;

use routekeeper_events::{
    AddressAdd, AddressRemove, Event, InterfaceAdd, InterfaceRemove, NeighbourEntry, Nexthop,
    RouteAdd, RouteRemove,
};
use routekeeper_networking::{Family, IpInterface, IpNetwork};

use super::index::SharedIndex;
use super::message::{
    AddressFamily, AddressMessage, KernelMessage, NeighbourMessage, RouteMessage, RouteType,
};

/// Messages kept per unknown interface index before the oldest is dropped.
pub const MAX_DEFERRED_PER_INDEX: usize = 64;

/// Unknown interface indexes tracked at once before the oldest is forgotten.
pub const MAX_DEFERRED_INDEXES: usize = 256;

/// Decodes kernel messages and maintains the interface index.
///
/// A message naming an interface index that has not been seen yet is parked
/// and decoded again right after that interface's link message.
#[derive(Debug)]
pub struct EventDecoder {
    index: SharedIndex,
    deferred: HashMap<u32, VecDeque<KernelMessage>>,
    /// Deferred indexes, oldest first.
    arrival: VecDeque<u32>,
}

impl EventDecoder {
    pub fn new(index: SharedIndex) -> Self {
        Self {
            index,
            deferred: HashMap::new(),
            arrival: VecDeque::new(),
        }
    }

    /// Decode one message into zero or more events.
    pub fn decode(&mut self, message: KernelMessage) -> Vec<Event> {
        match message {
            KernelMessage::NewLink(link) => {
                self.index
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(link.ifindex, &link.ifname);

                let ifindex = link.ifindex;
                let mut events = vec![Event::InterfaceAdd(InterfaceAdd {
                    ifindex: link.ifindex,
                    ifname: link.ifname,
                    kind: link.kind,
                    attributes: link.attributes,
                })];

                if let Some(parked) = self.forget_deferred(ifindex) {
                    debug!(ifindex, count = parked.len(), "Replaying deferred messages");
                    for message in parked {
                        events.extend(self.decode(message));
                    }
                }
                events
            }
            KernelMessage::DelLink(link) => {
                self.index
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(link.ifindex);
                self.forget_deferred(link.ifindex);

                vec![Event::InterfaceRemove(InterfaceRemove {
                    ifindex: link.ifindex,
                    ifname: link.ifname,
                })]
            }
            KernelMessage::NewAddress(ref address) | KernelMessage::DelAddress(ref address) => {
                let added = matches!(message, KernelMessage::NewAddress(_));
                match self.decode_address(address, added) {
                    Decoded::Event(event) => vec![event],
                    Decoded::Defer(ifindex) => self.defer(ifindex, message),
                    Decoded::Drop(reason) => {
                        debug!(message = message.name(), reason, "Dropping kernel message");
                        Vec::new()
                    }
                }
            }
            KernelMessage::NewRoute(ref route) | KernelMessage::DelRoute(ref route) => {
                let added = matches!(message, KernelMessage::NewRoute(_));
                match self.decode_route(route, added) {
                    Decoded::Event(event) => vec![event],
                    Decoded::Defer(ifindex) => self.defer(ifindex, message),
                    Decoded::Drop(reason) => {
                        debug!(message = message.name(), reason, "Dropping kernel message");
                        Vec::new()
                    }
                }
            }
            KernelMessage::NewNeighbour(ref neighbour)
            | KernelMessage::DelNeighbour(ref neighbour) => {
                let added = matches!(message, KernelMessage::NewNeighbour(_));
                match self.decode_neighbour(neighbour, added) {
                    Decoded::Event(event) => vec![event],
                    Decoded::Defer(ifindex) => self.defer(ifindex, message),
                    Decoded::Drop(reason) => {
                        debug!(message = message.name(), reason, "Dropping kernel message");
                        Vec::new()
                    }
                }
            }
        }
    }

    /// Number of messages waiting for an interface to appear.
    pub fn deferred_count(&self) -> usize {
        self.deferred.values().map(VecDeque::len).sum()
    }

    /// Number of interface indexes with deferred messages.
    pub fn deferred_indexes(&self) -> usize {
        self.deferred.len()
    }

    fn defer(&mut self, ifindex: u32, message: KernelMessage) -> Vec<Event> {
        if !self.deferred.contains_key(&ifindex) {
            if self.arrival.len() >= MAX_DEFERRED_INDEXES {
                if let Some(oldest) = self.arrival.pop_front() {
                    let dropped = self.deferred.remove(&oldest).map_or(0, |q| q.len());
                    debug!(
                        ifindex = oldest,
                        count = dropped,
                        "Too many unknown interfaces, dropping deferred messages"
                    );
                }
            }
            self.arrival.push_back(ifindex);
        }
        let queue = self.deferred.entry(ifindex).or_default();
        if queue.len() >= MAX_DEFERRED_PER_INDEX {
            if let Some(dropped) = queue.pop_front() {
                debug!(ifindex, message = dropped.name(), "Deferred queue full, dropping oldest");
            }
        }
        debug!(ifindex, message = message.name(), "Deferring message for unknown interface");
        queue.push_back(message);
        Vec::new()
    }

    fn forget_deferred(&mut self, ifindex: u32) -> Option<VecDeque<KernelMessage>> {
        let parked = self.deferred.remove(&ifindex)?;
        self.arrival.retain(|index| *index != ifindex);
        Some(parked)
    }

    fn ifname(&self, ifindex: u32) -> Option<String> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name(ifindex)
            .map(str::to_string)
    }

    fn decode_address(&self, message: &AddressMessage, added: bool) -> Decoded {
        if family(message.family).is_none() {
            return Decoded::Drop("address family");
        }

        let Some(local) = message.local.or(message.address) else {
            return Decoded::Drop("no address");
        };
        let Ok(address) = IpInterface::new(local, message.prefixlen) else {
            return Decoded::Drop("bad prefix length");
        };
        let peer = match (message.local, message.address) {
            (Some(l), Some(a)) if l != a => Some(a),
            _ => None,
        };

        let Some(ifname) = self.ifname(message.ifindex) else {
            return Decoded::Defer(message.ifindex);
        };

        let event = if added {
            Event::AddressAdd(AddressAdd {
                ifindex: message.ifindex,
                ifname,
                address,
                peer,
                scope: message.scope,
                label: message.label.clone(),
                protocol: message.protocol,
            })
        } else {
            Event::AddressRemove(AddressRemove {
                ifindex: message.ifindex,
                ifname,
                address,
            })
        };
        Decoded::Event(event)
    }

    fn decode_route(&self, message: &RouteMessage, added: bool) -> Decoded {
        let Some(family) = family(message.family) else {
            return Decoded::Drop("address family");
        };
        if message.route_type != RouteType::Unicast {
            return Decoded::Drop("route type");
        }

        let destination = match message.destination {
            Some(addr) => match IpNetwork::new(addr, message.dst_len) {
                Ok(net) => net,
                Err(_) => return Decoded::Drop("bad destination"),
            },
            None => IpNetwork::default_for(family),
        };

        if !added {
            return Decoded::Event(Event::RouteRemove(RouteRemove {
                table: message.table,
                destination,
            }));
        }

        let mut nexthops = Vec::with_capacity(message.nexthops.len());
        for nexthop in &message.nexthops {
            let ifname = match nexthop.oif {
                Some(oif) => match self.ifname(oif) {
                    Some(name) => Some(name),
                    None => return Decoded::Defer(oif),
                },
                None => None,
            };
            nexthops.push(Nexthop {
                gateway: nexthop.gateway,
                ifindex: nexthop.oif,
                ifname,
            });
        }

        Decoded::Event(Event::RouteAdd(RouteAdd {
            table: message.table,
            destination,
            protocol: message.protocol,
            scope: message.scope,
            prefsrc: message.prefsrc,
            nexthops,
        }))
    }

    fn decode_neighbour(&self, message: &NeighbourMessage, added: bool) -> Decoded {
        if family(message.family).is_none() {
            return Decoded::Drop("address family");
        }
        let Some(address) = message.destination else {
            return Decoded::Drop("no destination");
        };
        let Some(ifname) = self.ifname(message.ifindex) else {
            return Decoded::Defer(message.ifindex);
        };

        let entry = NeighbourEntry {
            ifindex: message.ifindex,
            ifname,
            address,
            lladdr: message.lladdr.clone(),
            state: message.state.clone(),
        };
        Decoded::Event(if added {
            Event::NeighbourAdd(entry)
        } else {
            Event::NeighbourRemove(entry)
        })
    }
}

enum Decoded {
    Event(Event),
    Defer(u32),
    Drop(&'static str),
}

fn family(family: AddressFamily) -> Option<Family> {
    match family {
        AddressFamily::Inet => Some(Family::Inet),
        AddressFamily::Inet6 => Some(Family::Inet6),
        AddressFamily::Other(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routekeeper_events::LinkAttributes;
    use routekeeper_networking::Scope;

    use crate::netlink::index::InterfaceIndex;
    use crate::netlink::message::{LinkMessage, NexthopMessage};

    fn link(ifindex: u32, name: &str) -> LinkMessage {
        LinkMessage {
            ifindex,
            ifname: name.to_string(),
            kind: None,
            attributes: LinkAttributes::default(),
        }
    }

    fn address(ifindex: u32, local: &str, prefixlen: u8) -> AddressMessage {
        AddressMessage {
            family: AddressFamily::Inet,
            ifindex,
            prefixlen,
            local: Some(local.parse().unwrap()),
            address: Some(local.parse().unwrap()),
            scope: Scope::Universe,
            label: None,
            protocol: None,
        }
    }

    fn default_route(oif: u32) -> RouteMessage {
        RouteMessage {
            family: AddressFamily::Inet,
            route_type: RouteType::Unicast,
            table: 254,
            destination: None,
            dst_len: 0,
            protocol: 4,
            scope: Scope::Universe,
            prefsrc: None,
            nexthops: vec![NexthopMessage {
                gateway: Some("192.0.2.1".parse().unwrap()),
                oif: Some(oif),
            }],
        }
    }

    #[test]
    fn test_link_updates_index() {
        let index = InterfaceIndex::shared();
        let mut decoder = EventDecoder::new(index.clone());

        let events = decoder.decode(KernelMessage::NewLink(link(2, "eth0")));
        assert_eq!(events.len(), 1);
        assert_eq!(index.read().unwrap().index("eth0"), Some(2));

        let events = decoder.decode(KernelMessage::DelLink(link(2, "eth0")));
        assert!(matches!(events[0], Event::InterfaceRemove(_)));
        assert!(index.read().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_index_is_deferred_then_replayed() {
        let mut decoder = EventDecoder::new(InterfaceIndex::shared());

        assert!(decoder
            .decode(KernelMessage::NewAddress(address(3, "10.1.2.3", 24)))
            .is_empty());
        assert!(decoder
            .decode(KernelMessage::NewRoute(default_route(3)))
            .is_empty());
        assert_eq!(decoder.deferred_count(), 2);

        let events = decoder.decode(KernelMessage::NewLink(link(3, "eth1")));
        assert_eq!(events.len(), 3);
        let Event::AddressAdd(added) = &events[1] else {
            panic!("expected address event");
        };
        assert_eq!(added.ifname, "eth1");
        assert_eq!(added.address.to_string(), "10.1.2.3/24");

        let Event::RouteAdd(route) = &events[2] else {
            panic!("expected route event");
        };
        assert_eq!(route.destination.to_string(), "0.0.0.0/0");
        assert_eq!(route.nexthops[0].ifname.as_deref(), Some("eth1"));
        assert_eq!(decoder.deferred_count(), 0);
    }

    #[test]
    fn test_irrelevant_family_is_dropped() {
        let mut decoder = EventDecoder::new(InterfaceIndex::shared());
        decoder.decode(KernelMessage::NewLink(link(2, "eth0")));

        let mut message = address(2, "10.0.0.1", 8);
        message.family = AddressFamily::Other(17);
        assert!(decoder.decode(KernelMessage::NewAddress(message)).is_empty());
        assert_eq!(decoder.deferred_count(), 0);
    }

    #[test]
    fn test_point_to_point_peer() {
        let mut decoder = EventDecoder::new(InterfaceIndex::shared());
        decoder.decode(KernelMessage::NewLink(link(4, "ppp0")));

        let mut message = address(4, "198.51.100.2", 32);
        message.address = Some("198.51.100.1".parse().unwrap());

        let events = decoder.decode(KernelMessage::NewAddress(message));
        let Event::AddressAdd(added) = &events[0] else {
            panic!("expected address event");
        };
        assert_eq!(added.address.to_string(), "198.51.100.2/32");
        assert_eq!(added.peer, Some("198.51.100.1".parse().unwrap()));
    }

    #[test]
    fn test_deferred_queue_is_bounded() {
        let mut decoder = EventDecoder::new(InterfaceIndex::shared());
        for i in 0..(MAX_DEFERRED_PER_INDEX + 5) {
            let addr = format!("10.0.{}.{}", i / 250, i % 250 + 1);
            decoder.decode(KernelMessage::NewAddress(address(9, &addr, 16)));
        }
        assert_eq!(decoder.deferred_count(), MAX_DEFERRED_PER_INDEX);
    }

    #[test]
    fn test_unknown_indexes_are_bounded() {
        let mut decoder = EventDecoder::new(InterfaceIndex::shared());
        for ifindex in 100..(100 + MAX_DEFERRED_INDEXES as u32 + 3) {
            decoder.decode(KernelMessage::NewAddress(address(ifindex, "10.9.0.1", 16)));
        }
        assert_eq!(decoder.deferred_indexes(), MAX_DEFERRED_INDEXES);
        assert_eq!(decoder.deferred_count(), MAX_DEFERRED_INDEXES);

        // The first three indexes were forgotten, the fourth still replays.
        let events = decoder.decode(KernelMessage::NewLink(link(100, "gone0")));
        assert_eq!(events.len(), 1);
        let events = decoder.decode(KernelMessage::NewLink(link(103, "kept0")));
        assert_eq!(events.len(), 2);
        assert_eq!(decoder.deferred_indexes(), MAX_DEFERRED_INDEXES - 1);
    }

    #[test]
    fn test_removed_link_discards_deferred_messages() {
        let mut decoder = EventDecoder::new(InterfaceIndex::shared());
        decoder.decode(KernelMessage::NewRoute(default_route(6)));
        assert_eq!(decoder.deferred_indexes(), 1);

        decoder.decode(KernelMessage::DelLink(link(6, "eth6")));
        assert_eq!(decoder.deferred_indexes(), 0);
        assert_eq!(decoder.deferred_count(), 0);
    }

    #[test]
    fn test_local_routes_are_dropped() {
        let mut decoder = EventDecoder::new(InterfaceIndex::shared());
        decoder.decode(KernelMessage::NewLink(link(1, "lo")));

        let mut route = default_route(1);
        route.route_type = RouteType::Local;
        assert!(decoder.decode(KernelMessage::NewRoute(route)).is_empty());
    }
}
