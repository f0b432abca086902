//! Route table — attached sockets, local handlers and forwarding sets.
//!
//! The [`RouteTable`] is plain data. The directory keeps it behind a single
//! mutex, so every mutation goes through one writer at a time, and never
//! holds the lock across an await point.

use crate::handler::{HandlerId, MessageHandler};
use crate::socket::{SocketAdapter, TransportKind};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use urnet_types::{Address, AddressAllocator, BusError, BusResult, Channel, MessageName};

/// Lifecycle state of an attached socket slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Traffic seen since the last aging tick.
    Active,
    /// At least one tick without traffic.
    Idle,
}

/// One attached socket adapter.
pub(crate) struct Slot {
    pub socket: Arc<dyn SocketAdapter>,
    /// The remote directory's own address, learned during the handshake.
    pub peer: Option<Address>,
    /// Aging ticks since the last inbound frame.
    pub age: u32,
    pub attached_at: DateTime<Utc>,
    /// Nonce we issued in our welcome, when we are the accepting side.
    pub nonce: Option<String>,
    /// Last service set announced over this link.
    pub announced: Option<BTreeSet<String>>,
}

impl Slot {
    pub fn state(&self) -> SlotState {
        if self.age == 0 {
            SlotState::Active
        } else {
            SlotState::Idle
        }
    }
}

/// Snapshot of one link for diagnostics.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub address: Address,
    pub peer: Option<Address>,
    pub transport: TransportKind,
    pub label: String,
    pub state: SlotState,
    pub age: u32,
    pub attached_at: DateTime<Utc>,
}

/// A forwarding candidate resolved for one dispatch.
pub(crate) struct Target {
    pub link: Address,
    /// Address used for loop checks: the peer's own address when known.
    pub identity: Address,
    pub socket: Arc<dyn SocketAdapter>,
}

type HandlerEntry = (HandlerId, Arc<dyn MessageHandler>);

pub(crate) struct RouteTable {
    allocator: AddressAllocator,
    slots: BTreeMap<Address, Slot>,
    handlers: HashMap<MessageName, Vec<HandlerEntry>>,
    forwards: HashMap<MessageName, BTreeSet<Address>>,
}

impl RouteTable {
    pub fn new(prefix: &str) -> BusResult<Self> {
        Ok(Self {
            allocator: AddressAllocator::new(prefix)?,
            slots: BTreeMap::new(),
            handlers: HashMap::new(),
            forwards: HashMap::new(),
        })
    }

    /// Allocate an address for the socket and record it.
    pub fn attach(
        &mut self,
        socket: Arc<dyn SocketAdapter>,
        reserved: &Address,
    ) -> BusResult<Address> {
        if let Some(existing) = socket.address() {
            return Err(BusError::DuplicateAttachment(existing.to_string()));
        }
        let addr = self.allocator.allocate(reserved);
        if !socket.bind_address(addr.clone()) {
            let existing = socket.address().unwrap_or(addr);
            return Err(BusError::DuplicateAttachment(existing.to_string()));
        }
        self.slots.insert(
            addr.clone(),
            Slot {
                socket,
                peer: None,
                age: 0,
                attached_at: Utc::now(),
                nonce: None,
                announced: None,
            },
        );
        Ok(addr)
    }

    /// Remove the slot and purge the address from every forwarding set.
    pub fn detach(&mut self, addr: &Address) -> BusResult<Slot> {
        let slot = self
            .slots
            .remove(addr)
            .ok_or_else(|| BusError::UnknownAddress(addr.to_string()))?;
        self.purge_forwarding(addr);
        Ok(slot)
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.slots.contains_key(addr)
    }

    pub fn slot(&self, addr: &Address) -> Option<&Slot> {
        self.slots.get(addr)
    }

    pub fn slot_mut(&mut self, addr: &Address) -> Option<&mut Slot> {
        self.slots.get_mut(addr)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.slots.keys().cloned().collect()
    }

    pub fn add_handler(&mut self, name: MessageName, handler: Arc<dyn MessageHandler>) -> HandlerId {
        let id = HandlerId::next();
        self.handlers.entry(name).or_default().push((id, handler));
        id
    }

    pub fn remove_handler(&mut self, name: &MessageName, id: HandlerId) -> bool {
        let Some(entries) = self.handlers.get_mut(name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(h, _)| *h != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.handlers.remove(name);
        }
        removed
    }

    pub fn local_handlers(&self, name: &MessageName) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers
            .get(name)
            .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Replace the names forwarded to `addr`. Returns whether anything changed.
    pub fn set_forwarding(&mut self, addr: &Address, names: &[MessageName]) -> BusResult<bool> {
        if !self.slots.contains_key(addr) {
            return Err(BusError::UnknownAddress(addr.to_string()));
        }
        let before = self.names_forwarded_to(addr);
        self.purge_forwarding(addr);
        for name in names {
            self.forwards
                .entry(name.clone())
                .or_default()
                .insert(addr.clone());
        }
        Ok(before != self.names_forwarded_to(addr))
    }

    pub fn clear_forwarding(&mut self, addr: &Address) -> BusResult<bool> {
        self.set_forwarding(addr, &[])
    }

    fn purge_forwarding(&mut self, addr: &Address) {
        self.forwards.retain(|_, targets| {
            targets.remove(addr);
            !targets.is_empty()
        });
    }

    fn names_forwarded_to(&self, addr: &Address) -> BTreeSet<String> {
        self.forwards
            .iter()
            .filter(|(_, targets)| targets.contains(addr))
            .map(|(name, _)| name.to_string())
            .collect()
    }

    pub fn forwarding_targets(&self, name: &MessageName) -> Vec<Address> {
        self.forwards
            .get(name)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Resolve forwarding targets for a message, honoring transport tags.
    pub fn targets(&self, name: &MessageName) -> Vec<Target> {
        let wanted = match name.channel() {
            Channel::Ipc => Some(TransportKind::Pipe),
            Channel::Ws => Some(TransportKind::WebSocket),
            Channel::Local | Channel::Net => None,
        };
        let Some(links) = self.forwards.get(name) else {
            return Vec::new();
        };
        links
            .iter()
            .filter_map(|link| {
                let slot = self.slots.get(link)?;
                if wanted.is_some_and(|kind| slot.socket.transport() != kind) {
                    return None;
                }
                Some(Target {
                    link: link.clone(),
                    identity: slot.peer.clone().unwrap_or_else(|| link.clone()),
                    socket: Arc::clone(&slot.socket),
                })
            })
            .collect()
    }

    /// Find the link leading to a directory address: a slot whose peer is
    /// `addr`, or a not-yet-handshaken slot attached under `addr` itself.
    pub fn link_to(&self, addr: &Address) -> Option<(Address, Arc<dyn SocketAdapter>)> {
        self.slots
            .iter()
            .find(|(link, slot)| match &slot.peer {
                Some(peer) => peer == addr,
                None => *link == addr,
            })
            .map(|(link, slot)| (link.clone(), Arc::clone(&slot.socket)))
    }

    /// Reset the idle age of a slot after inbound traffic.
    pub fn touch(&mut self, addr: &Address) {
        if let Some(slot) = self.slots.get_mut(addr) {
            slot.age = 0;
        }
    }

    /// Age every slot by one tick and return those past `max_age`.
    pub fn tick(&mut self, max_age: u32) -> Vec<Address> {
        let mut expired = Vec::new();
        for (addr, slot) in self.slots.iter_mut() {
            slot.age = slot.age.saturating_add(1);
            if slot.age > max_age {
                expired.push(addr.clone());
            }
        }
        expired
    }

    /// Names this directory can service on behalf of `link`: its local
    /// handlers plus whatever it forwards to other links.
    pub fn services_for(&self, link: Option<&Address>) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.handlers.keys().map(|n| n.to_string()).collect();
        for (name, targets) in &self.forwards {
            if targets.iter().any(|t| Some(t) != link) {
                names.insert(name.to_string());
            }
        }
        names
    }

    /// Announcements owed to handshaken links whose service set changed.
    pub fn pending_announcements(&mut self) -> Vec<(Arc<dyn SocketAdapter>, BTreeSet<String>)> {
        let links: Vec<Address> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.peer.is_some())
            .map(|(addr, _)| addr.clone())
            .collect();
        let mut owed = Vec::new();
        for link in links {
            let services = self.services_for(Some(&link));
            if let Some(slot) = self.slots.get_mut(&link) {
                if slot.announced.as_ref() != Some(&services) {
                    slot.announced = Some(services.clone());
                    owed.push((Arc::clone(&slot.socket), services));
                }
            }
        }
        owed
    }

    /// Every routable name with the addresses that serve it.
    pub fn service_map(&self, own: &Address) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in self.handlers.keys() {
            map.entry(name.to_string())
                .or_default()
                .push(own.to_string());
        }
        for (name, targets) in &self.forwards {
            map.entry(name.to_string())
                .or_default()
                .extend(targets.iter().map(Address::to_string));
        }
        map
    }

    pub fn links(&self) -> Vec<LinkInfo> {
        self.slots
            .iter()
            .map(|(addr, slot)| LinkInfo {
                address: addr.clone(),
                peer: slot.peer.clone(),
                transport: slot.socket.transport(),
                label: slot.socket.label(),
                state: slot.state(),
                age: slot.age,
                attached_at: slot.attached_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::socket::Outbox;
    use urnet_types::Frame;

    struct NullSocket {
        outbox: Outbox,
        kind: TransportKind,
    }

    impl NullSocket {
        fn new(kind: TransportKind) -> Arc<dyn SocketAdapter> {
            let (outbox, _rx) = Outbox::channel();
            Arc::new(Self { outbox, kind })
        }
    }

    impl SocketAdapter for NullSocket {
        fn transport(&self) -> TransportKind {
            self.kind
        }
        fn label(&self) -> String {
            "null".to_string()
        }
        fn address(&self) -> Option<Address> {
            self.outbox.address()
        }
        fn bind_address(&self, address: Address) -> bool {
            self.outbox.bind_address(address)
        }
        fn send(&self, _frame: Frame) -> BusResult<()> {
            Ok(())
        }
        fn close(&self) {}
    }

    fn name(s: &str) -> MessageName {
        MessageName::parse(s).unwrap()
    }

    fn table() -> RouteTable {
        RouteTable::new("UADDR").unwrap()
    }

    #[test]
    fn test_attach_allocates_unique_addresses() {
        let mut t = table();
        let me = Address::hub();
        let mut live = BTreeSet::new();
        for round in 0..20 {
            let addr = t.attach(NullSocket::new(TransportKind::Loopback), &me).unwrap();
            assert!(live.insert(addr.clone()), "address {addr} handed out twice");
            if round % 3 == 0 {
                t.detach(&addr).unwrap();
                live.remove(&addr);
            }
        }
        assert_eq!(t.addresses().len(), live.len());
    }

    #[test]
    fn test_attach_twice_is_duplicate() {
        let mut t = table();
        let socket = NullSocket::new(TransportKind::Pipe);
        t.attach(Arc::clone(&socket), &Address::hub()).unwrap();
        assert!(matches!(
            t.attach(socket, &Address::hub()),
            Err(BusError::DuplicateAttachment(_))
        ));
    }

    #[test]
    fn test_detach_unknown() {
        let mut t = table();
        assert!(matches!(
            t.detach(&Address::parse("UADDR_09").unwrap()),
            Err(BusError::UnknownAddress(_))
        ));
    }

    #[test]
    fn test_detach_purges_forwarding() {
        let mut t = table();
        let a = t.attach(NullSocket::new(TransportKind::Pipe), &Address::hub()).unwrap();
        let b = t.attach(NullSocket::new(TransportKind::Pipe), &Address::hub()).unwrap();
        t.set_forwarding(&a, &[name("FOO"), name("BAR")]).unwrap();
        t.set_forwarding(&b, &[name("FOO")]).unwrap();

        t.detach(&a).unwrap();
        assert_eq!(t.forwarding_targets(&name("FOO")), vec![b]);
        assert!(t.forwarding_targets(&name("BAR")).is_empty());
    }

    #[test]
    fn test_set_forwarding_reports_changes() {
        let mut t = table();
        let a = t.attach(NullSocket::new(TransportKind::Pipe), &Address::hub()).unwrap();
        assert!(t.set_forwarding(&a, &[name("FOO")]).unwrap());
        assert!(!t.set_forwarding(&a, &[name("FOO")]).unwrap());
        assert!(t.clear_forwarding(&a).unwrap());
        assert!(matches!(
            t.set_forwarding(&Address::parse("UADDR_77").unwrap(), &[]),
            Err(BusError::UnknownAddress(_))
        ));
    }

    #[test]
    fn test_transport_tag_filters_targets() {
        let mut t = table();
        let pipe = t.attach(NullSocket::new(TransportKind::Pipe), &Address::hub()).unwrap();
        let ws = t.attach(NullSocket::new(TransportKind::WebSocket), &Address::hub()).unwrap();
        for n in ["WS:NOTE", "IPC:NOTE", "NOTE"] {
            t.forwards.entry(name(n)).or_default().extend([pipe.clone(), ws.clone()]);
        }
        let links = |n: &str| t.targets(&name(n)).into_iter().map(|x| x.link).collect::<Vec<_>>();
        assert_eq!(links("WS:NOTE"), vec![ws.clone()]);
        assert_eq!(links("IPC:NOTE"), vec![pipe.clone()]);
        assert_eq!(links("NOTE").len(), 2);
    }

    #[test]
    fn test_tick_expires_idle_slots() {
        let mut t = table();
        let a = t.attach(NullSocket::new(TransportKind::Pipe), &Address::hub()).unwrap();
        let b = t.attach(NullSocket::new(TransportKind::Pipe), &Address::hub()).unwrap();
        assert!(t.tick(2).is_empty());
        assert_eq!(t.slot(&a).unwrap().state(), SlotState::Idle);
        t.touch(&a);
        assert_eq!(t.slot(&a).unwrap().state(), SlotState::Active);
        assert!(t.tick(2).is_empty());
        assert_eq!(t.tick(2), vec![b]);
    }

    #[test]
    fn test_services_exclude_the_asking_link() {
        let mut t = table();
        let a = t.attach(NullSocket::new(TransportKind::Pipe), &Address::hub()).unwrap();
        let b = t.attach(NullSocket::new(TransportKind::Pipe), &Address::hub()).unwrap();
        t.add_handler(name("LOCAL"), handler_fn(|v| async move { Ok(v) }));
        t.set_forwarding(&a, &[name("FROM_A")]).unwrap();

        let for_a = t.services_for(Some(&a));
        let for_b = t.services_for(Some(&b));
        assert!(for_a.contains("LOCAL") && !for_a.contains("FROM_A"));
        assert!(for_b.contains("LOCAL") && for_b.contains("FROM_A"));
    }

    #[test]
    fn test_announcements_only_when_changed() {
        let mut t = table();
        let a = t.attach(NullSocket::new(TransportKind::Pipe), &Address::hub()).unwrap();
        assert!(t.pending_announcements().is_empty(), "not handshaken yet");

        t.slot_mut(&a).unwrap().peer = Some(a.clone());
        assert_eq!(t.pending_announcements().len(), 1);
        assert!(t.pending_announcements().is_empty());

        let id = t.add_handler(name("FOO"), handler_fn(|v| async move { Ok(v) }));
        assert_eq!(t.pending_announcements().len(), 1);
        assert!(t.remove_handler(&name("FOO"), id));
        assert!(!t.remove_handler(&name("FOO"), id));
        assert_eq!(t.pending_announcements().len(), 1);
    }

    #[test]
    fn test_link_to_prefers_peer_identity() {
        let mut t = table();
        let a = t.attach(NullSocket::new(TransportKind::Pipe), &Address::hub()).unwrap();
        let peer = Address::parse("NODE_05").unwrap();
        assert_eq!(t.link_to(&a).map(|(l, _)| l), Some(a.clone()));
        t.slot_mut(&a).unwrap().peer = Some(peer.clone());
        assert_eq!(t.link_to(&peer).map(|(l, _)| l), Some(a.clone()));
        assert!(t.link_to(&a).is_none());
    }
}
