//! Directory — the per-process router.
//!
//! A [`Directory`] owns the attached socket adapters, the per-message route
//! tables and the transaction tracker. It is a cheap `Clone` handle around
//! shared state; the route table sits behind one mutex that is never held
//! across an await or while calling into an adapter.
//!
//! Dispatch is first-match-wins: local handlers answer a message when any
//! are registered (and the channel allows it), otherwise the packet is
//! copied to every forwarding target. Responses walk the hop sequence back
//! to the directory that originated the request.

use crate::auth;
use crate::handler::{HandlerId, MessageHandler};
use crate::routes::{LinkInfo, RouteTable, Target};
use crate::shutdown::{ShutdownCoordinator, ShutdownPhase};
use crate::socket::{SocketAdapter, SocketEvent};
use crate::transaction::{PendingCall, RelayGroup, Settled, TransactionTracker};
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use urnet_types::config::{DirectoryConfig, MIN_AGE_INTERVAL_MS};
use urnet_types::frame::PROTOCOL_VERSION;
use urnet_types::{
    Address, BusError, BusResult, Frame, InvocationKind, MessageName, Packet, TransactionKey,
};

/// Routing outcome of one dispatch.
#[derive(Debug, Default)]
pub struct Delivery {
    /// Local handlers invoked.
    pub local: usize,
    /// Links a copy was queued on.
    pub forwarded: Vec<Address>,
    /// Links that were skipped or refused the copy.
    pub failed: Vec<(Address, BusError)>,
}

struct Inner {
    config: DirectoryConfig,
    secret: Option<String>,
    address: RwLock<Address>,
    /// Set once the self address is configured or adopted from a hub.
    address_fixed: AtomicBool,
    routes: Mutex<RouteTable>,
    tracker: TransactionTracker,
    shutdown: ShutdownCoordinator,
    /// Bumped on every route change; `wait_for_route` listens to it.
    route_epoch: watch::Sender<u64>,
}

/// Handle to one directory.
#[derive(Clone)]
pub struct Directory {
    inner: Arc<Inner>,
}

/// Non-owning handle, for handlers that need their own directory.
#[derive(Clone)]
pub struct WeakDirectory {
    inner: Weak<Inner>,
}

impl WeakDirectory {
    pub fn upgrade(&self) -> Option<Directory> {
        self.inner.upgrade().map(|inner| Directory { inner })
    }
}

impl Directory {
    /// Create a directory without handshake authentication.
    pub fn new(config: DirectoryConfig) -> BusResult<Self> {
        Self::with_secret(config, None)
    }

    /// Create a directory that requires `HMAC(secret)` from connecting peers.
    pub fn with_secret(config: DirectoryConfig, secret: Option<String>) -> BusResult<Self> {
        let (address, fixed) = match &config.address {
            Some(addr) => (Address::parse(addr)?, true),
            None => (Address::hub(), false),
        };
        let routes = RouteTable::new(&config.address_prefix)?;
        if config.age_interval_ms < MIN_AGE_INTERVAL_MS {
            warn!(
                age_interval_ms = config.age_interval_ms,
                min = MIN_AGE_INTERVAL_MS,
                "Aging interval too short, raising it"
            );
        }
        let (route_epoch, _) = watch::channel(0);
        info!(address = %address, prefix = %config.address_prefix, "Directory created");
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                secret: secret.filter(|s| !s.is_empty()),
                address: RwLock::new(address),
                address_fixed: AtomicBool::new(fixed),
                routes: Mutex::new(routes),
                tracker: TransactionTracker::new(),
                shutdown: ShutdownCoordinator::new(),
                route_epoch,
            }),
        })
    }

    /// This directory's own address.
    pub fn address(&self) -> Address {
        self.inner
            .address
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn downgrade(&self) -> WeakDirectory {
        WeakDirectory {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.inner.config
    }

    fn routes(&self) -> MutexGuard<'_, RouteTable> {
        self.inner.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---------------------------------------------------------------------
    // Attachment
    // ---------------------------------------------------------------------

    /// Attach a socket adapter and allocate its address.
    pub fn attach(&self, socket: Arc<dyn SocketAdapter>) -> BusResult<Address> {
        if self.is_shutting_down() {
            return Err(BusError::ShuttingDown);
        }
        let me = self.address();
        let transport = socket.transport();
        let label = socket.label();
        let addr = self.routes().attach(socket, &me)?;
        info!(address = %addr, %transport, peer = %label, "Socket attached");
        Ok(addr)
    }

    /// Detach a socket: close it, purge its routes and fail every
    /// transaction that was waiting on it.
    pub fn detach(&self, addr: &Address) -> BusResult<Address> {
        let slot = self.routes().detach(addr)?;
        slot.socket.close();
        info!(address = %addr, peer = ?slot.peer, "Socket detached");

        let error = BusError::TransportSendFailure(format!("link {addr} detached"));
        for settled in self.inner.tracker.fail_via(addr, &error) {
            self.handle_settled(settled);
        }
        self.routes_changed();
        Ok(addr.clone())
    }

    /// Detach by adapter rather than address.
    pub fn detach_socket(&self, socket: &dyn SocketAdapter) -> BusResult<Address> {
        let addr = socket
            .address()
            .ok_or_else(|| BusError::UnknownAddress(format!("unattached {}", socket.label())))?;
        self.detach(&addr)
    }

    pub fn is_attached(&self, addr: &Address) -> bool {
        self.routes().contains(addr)
    }

    pub fn links(&self) -> Vec<LinkInfo> {
        self.routes().links()
    }

    /// React to a transport lifecycle event for an attached socket.
    pub fn on_socket_event(&self, addr: &Address, event: SocketEvent) {
        match event {
            SocketEvent::Connected => debug!(address = %addr, "Socket connected"),
            SocketEvent::Disconnected => {
                if self.detach(addr).is_ok() {
                    debug!(address = %addr, "Socket disconnected");
                }
            }
            SocketEvent::Error(e) => {
                warn!(address = %addr, error = %e, "Socket error");
                let error = BusError::TransportSendFailure(format!("{addr}: {e}"));
                for settled in self.inner.tracker.fail_via(addr, &error) {
                    self.handle_settled(settled);
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Route tables
    // ---------------------------------------------------------------------

    /// Register a local handler for a message name.
    pub fn register_handler(
        &self,
        message: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> BusResult<HandlerId> {
        let name = MessageName::parse(message)?;
        let id = self.routes().add_handler(name, handler);
        debug!(message, "Local handler registered");
        self.routes_changed();
        Ok(id)
    }

    /// Remove a local handler. Returns `false` if it was not registered.
    pub fn unregister_handler(&self, message: &str, id: HandlerId) -> BusResult<bool> {
        let name = MessageName::parse(message)?;
        let removed = self.routes().remove_handler(&name, id);
        if removed {
            debug!(message, "Local handler unregistered");
            self.routes_changed();
        }
        Ok(removed)
    }

    /// Relay the listed names to an attached remote address.
    pub fn register_forwarding<I, S>(&self, addr: &Address, messages: I) -> BusResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = messages
            .into_iter()
            .map(|m| MessageName::parse(m.as_ref()))
            .collect::<BusResult<Vec<_>>>()?;
        if self.routes().set_forwarding(addr, &names)? {
            debug!(address = %addr, count = names.len(), "Forwarding updated");
            self.routes_changed();
        }
        Ok(())
    }

    /// Stop relaying anything to `addr`.
    pub fn unregister_forwarding(&self, addr: &Address) -> BusResult<()> {
        if self.routes().clear_forwarding(addr)? {
            self.routes_changed();
        }
        Ok(())
    }

    pub fn forwarding_targets(&self, message: &str) -> BusResult<Vec<Address>> {
        let name = MessageName::parse(message)?;
        Ok(self.routes().forwarding_targets(&name))
    }

    /// Every routable name, with the addresses that serve it.
    pub fn services(&self) -> BTreeMap<String, Vec<String>> {
        let me = self.address();
        self.routes().service_map(&me)
    }

    /// Wait until `message` has a local handler or forwarding target.
    pub async fn wait_for_route(&self, message: &str, timeout: Duration) -> BusResult<()> {
        let name = MessageName::parse(message)?;
        let mut epoch = self.inner.route_epoch.subscribe();
        let routed = tokio::time::timeout(timeout, async {
            loop {
                {
                    let routes = self.routes();
                    if !routes.local_handlers(&name).is_empty() || !routes.targets(&name).is_empty()
                    {
                        return true;
                    }
                }
                if epoch.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        match routed {
            Ok(true) => Ok(()),
            _ => Err(BusError::NoRoute(format!("'{name}' at {}", self.address()))),
        }
    }

    fn routes_changed(&self) {
        self.inner.route_epoch.send_modify(|e| *e += 1);
        self.flush_announcements();
    }

    /// Send each handshaken peer its service set, if it changed.
    fn flush_announcements(&self) {
        let me = self.address();
        let owed = self.routes().pending_announcements();
        for (socket, services) in owed {
            let frame = Frame::Announce {
                address: me.clone(),
                services: services.into_iter().collect(),
                auth_hmac: String::new(),
            };
            if let Err(e) = socket.send(frame) {
                debug!(peer = %socket.label(), error = %e, "Announcement not sent");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    /// Stamp a packet with this directory as its source.
    pub fn stamp(&self, packet: &mut Packet, kind: InvocationKind) -> BusResult<()> {
        packet.assign_identity(kind, self.address().as_str())
    }

    /// Register a caller waiting for the response to `packet`.
    pub fn begin_call(&self, packet: &Packet) -> BusResult<PendingCall> {
        let pending = self.inner.tracker.begin(packet)?;
        self.schedule_timeout(pending.key().clone());
        Ok(pending)
    }

    /// Cancel a caller's pending transaction.
    pub fn cancel(&self, key: &TransactionKey) -> bool {
        self.inner.tracker.cancel(key)
    }

    pub fn pending_transactions(&self) -> usize {
        self.inner.tracker.len()
    }

    pub fn is_pending(&self, key: &TransactionKey) -> bool {
        self.inner.tracker.contains(key)
    }

    /// Route one packet.
    ///
    /// Requests that expect a response are always answered, so a caller's
    /// future settles even when this returns an error. Signals and sends
    /// only get the error back as a value.
    pub fn dispatch(&self, packet: Packet) -> BusResult<Delivery> {
        if packet.is_response() {
            self.route_response(packet);
            return Ok(Delivery::default());
        }
        if self.is_shutting_down() {
            return self.refuse(&packet, BusError::ShuttingDown);
        }

        let name = packet.message().clone();
        let (handlers, targets) = {
            let routes = self.routes();
            let handlers = if name.channel().allows_local(packet.hops().len()) {
                routes.local_handlers(&name)
            } else {
                Vec::new()
            };
            let targets = if handlers.is_empty() {
                routes.targets(&name)
            } else {
                Vec::new()
            };
            (handlers, targets)
        };

        if !handlers.is_empty() {
            let local = handlers.len();
            debug!(message = %name, id = packet.id(), local, "Dispatching to local handlers");
            self.invoke_local(packet, handlers);
            return Ok(Delivery {
                local,
                ..Delivery::default()
            });
        }
        if targets.is_empty() {
            let error = BusError::NoRoute(format!("'{name}' at {}", self.address()));
            return self.refuse(&packet, error);
        }
        self.forward(packet, targets)
    }

    /// Answer (if a response is owed) or log a routing failure.
    fn refuse(&self, packet: &Packet, error: BusError) -> BusResult<Delivery> {
        if packet.kind().expects_response() {
            debug!(message = %packet.message(), id = packet.id(), error = %error, "Answering with error");
            self.respond(packet, Err(error.duplicate()));
        } else {
            warn!(message = %packet.message(), kind = ?packet.kind(), error = %error, "Dropping packet");
        }
        Err(error)
    }

    fn invoke_local(&self, packet: Packet, handlers: Vec<Arc<dyn MessageHandler>>) {
        match packet.kind() {
            InvocationKind::Ping => {
                let me = self.address();
                self.respond(&packet, Ok(json!({ "address": me })));
            }
            InvocationKind::Call => {
                let dir = self.clone();
                tokio::spawn(async move {
                    let payload = packet.payload().clone();
                    let results = join_all(handlers.iter().map(|h| h.handle(payload.clone()))).await;
                    let mut first_error = None;
                    for result in results {
                        match result {
                            Ok(value) => {
                                dir.respond(&packet, Ok(value));
                                return;
                            }
                            Err(e) => {
                                first_error.get_or_insert(e);
                            }
                        }
                    }
                    let error = first_error.unwrap_or_else(|| "handler returned nothing".to_string());
                    dir.respond(&packet, Err(BusError::Remote(error)));
                });
            }
            InvocationKind::Signal | InvocationKind::Send => {
                for handler in handlers {
                    let payload = packet.payload().clone();
                    let message = packet.message().clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle(payload).await {
                            warn!(message = %message, error = %e, "Handler failed");
                        }
                    });
                }
            }
        }
    }

    /// Copy the packet to every target, appending our address to each copy.
    fn forward(&self, packet: Packet, targets: Vec<Target>) -> BusResult<Delivery> {
        if packet.hops().len() >= self.inner.config.max_hops {
            let error = BusError::LoopDetected(format!(
                "{} {} exceeded {} hops",
                packet.message(),
                packet.id(),
                self.inner.config.max_hops
            ));
            return self.refuse(&packet, error);
        }

        let me = self.address();
        let group = packet
            .kind()
            .expects_response()
            .then(|| RelayGroup::new(packet.clone(), targets.len()));
        let mut delivery = Delivery::default();

        for target in targets {
            let mut copy = packet.duplicate();
            let hop = if copy.hops().contains(&target.identity) {
                Err(BusError::LoopDetected(format!(
                    "{} {} already passed through {}",
                    packet.message(),
                    packet.id(),
                    target.identity
                )))
            } else {
                copy.append_hop(&me)
            };
            if let Err(e) = hop {
                debug!(target = %target.link, error = %e, "Skipping forward target");
                if let Some(group) = &group {
                    self.offer_to_group(group, Err(e.duplicate()), None);
                }
                delivery.failed.push((target.link, e));
                continue;
            }

            copy.log(format!("{me} -> {} via {}", target.identity, target.link));
            let key = copy.transaction_key();
            if let (Some(group), Some(key)) = (&group, &key) {
                self.inner
                    .tracker
                    .relay(key.clone(), Arc::clone(group), target.link.clone());
                self.schedule_timeout(key.clone());
            }

            match target.socket.send(Frame::Packet(copy)) {
                Ok(()) => {
                    debug!(message = %packet.message(), target = %target.link, "Forwarded");
                    delivery.forwarded.push(target.link);
                }
                Err(e) => {
                    warn!(target = %target.link, error = %e, "Forward failed");
                    if let Some(key) = &key {
                        if let Some(settled) = self.inner.tracker.fail(key, e.duplicate()) {
                            self.handle_settled(settled);
                        }
                    }
                    delivery.failed.push((target.link, e));
                }
            }
        }

        if delivery.forwarded.is_empty() {
            let error = delivery
                .failed
                .first()
                .map(|(_, e)| e.duplicate())
                .unwrap_or_else(|| BusError::NoRoute(packet.message().to_string()));
            if group.is_none() {
                warn!(message = %packet.message(), error = %error, "No forward target accepted the packet");
            }
            return Err(error);
        }
        Ok(delivery)
    }

    // ---------------------------------------------------------------------
    // Responses
    // ---------------------------------------------------------------------

    /// Answer a request from this directory.
    fn respond(&self, request: &Packet, outcome: BusResult<Value>) {
        let me = self.address();
        let mut response = request.make_response(outcome.map_err(|e| e.to_wire()));
        response.mark_responder(&me);
        response.log(format!("{me} answered"));
        self.route_response(response);
    }

    /// Send a response one hop back toward its origin, or settle it here
    /// if this directory is the origin.
    fn route_response(&self, response: Packet) {
        let me = self.address();
        let Some(previous) = response.previous_hop(&me).cloned() else {
            self.complete_response(response);
            return;
        };
        let link = self.routes().link_to(&previous);
        match link {
            Some((link, socket)) => {
                debug!(id = response.id(), back_to = %previous, via = %link, "Returning response");
                if let Err(e) = socket.send(Frame::Packet(response)) {
                    warn!(back_to = %previous, error = %e, "Response could not be returned");
                }
            }
            None => warn!(
                id = response.id(),
                back_to = %previous,
                "No link back toward the caller, dropping response"
            ),
        }
    }

    fn complete_response(&self, response: Packet) {
        match self.inner.tracker.complete(&response) {
            Ok(settled) => self.handle_settled(settled),
            Err(e) => warn!(message = %response.message(), error = %e, "Ignoring response"),
        }
    }

    fn handle_settled(&self, settled: Settled) {
        if let Settled::Relay {
            group,
            outcome,
            response,
        } = settled
        {
            self.offer_to_group(&group, outcome, response.as_ref());
        }
    }

    /// Feed a copy's outcome to its group; answer the original request
    /// once the group settles.
    fn offer_to_group(&self, group: &RelayGroup, outcome: BusResult<Value>, downstream: Option<&Packet>) {
        let Some(outcome) = group.offer(outcome) else {
            return;
        };
        let me = self.address();
        let mut reply = group.parent().make_response(outcome.map_err(|e| e.to_wire()));
        if let Some(downstream) = downstream {
            reply.inherit_trail(downstream);
        }
        reply.mark_responder(&me);
        reply.log(format!("{me} relayed"));
        self.route_response(reply);
    }

    fn schedule_timeout(&self, key: TransactionKey) {
        let weak = self.downgrade();
        let after = self.inner.config.call_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(dir) = weak.upgrade() else {
                return;
            };
            if let Some(settled) = dir.inner.tracker.timeout(&key) {
                warn!(key = %key, timeout_ms = after.as_millis() as u64, "Transaction timed out");
                dir.handle_settled(settled);
            }
        });
    }

    // ---------------------------------------------------------------------
    // Inbound frames and handshake
    // ---------------------------------------------------------------------

    /// Handle a frame that arrived on an attached socket.
    pub fn receive(&self, from: &Address, frame: Frame) {
        let (socket, unverified, dialed) = {
            let mut routes = self.routes();
            let Some(slot) = routes.slot(from) else {
                warn!(address = %from, kind = frame.kind(), "Frame from unattached socket");
                return;
            };
            // We greeted this link and hold a secret, but it has not announced yet.
            let unverified =
                self.inner.secret.is_some() && slot.nonce.is_some() && slot.peer.is_none();
            let dialed = slot.nonce.is_none() && slot.peer.is_some();
            let socket = Arc::clone(&slot.socket);
            routes.touch(from);
            (socket, unverified, dialed)
        };
        if unverified && matches!(frame, Frame::Packet(_) | Frame::Welcome { .. }) {
            warn!(address = %from, kind = frame.kind(), "Frame before authenticated announce");
            self.expel(from, "authentication required");
            return;
        }
        match frame {
            Frame::Packet(packet) => self.receive_packet(from, packet),
            Frame::Welcome {
                assigned,
                hub,
                services,
                nonce,
                protocol_version,
            } => self.accept_welcome(from, assigned, hub, services, nonce, protocol_version),
            Frame::Announce {
                address,
                services,
                auth_hmac,
            } => self.accept_announce(from, address, services, auth_hmac),
            Frame::Heartbeat => {
                // The dialing side answers so the hub sees traffic on idle links.
                if dialed {
                    let _ = socket.send(Frame::Heartbeat);
                }
            }
            Frame::Goodbye { reason } => {
                info!(address = %from, reason = %reason, "Peer said goodbye");
                let _ = self.detach(from);
            }
        }
    }

    /// Tell a peer why it is being dropped, then detach it.
    fn expel(&self, link: &Address, reason: &str) {
        let socket = self.routes().slot(link).map(|s| Arc::clone(&s.socket));
        if let Some(socket) = socket {
            let _ = socket.send(Frame::Goodbye {
                reason: reason.to_string(),
            });
        }
        let _ = self.detach(link);
    }

    fn receive_packet(&self, from: &Address, mut packet: Packet) {
        if packet.transaction_key().is_none() {
            warn!(address = %from, message = %packet.message(), "Packet without identity");
            return;
        }
        packet.log(format!("{} received from {from}", self.address()));
        if packet.is_response() {
            self.complete_response(packet);
            return;
        }
        if let Err(e) = self.dispatch(packet) {
            debug!(address = %from, error = %e, "Inbound packet not routed");
        }
    }

    /// Accepting side: tell a freshly attached peer its address and what
    /// this directory can service for it.
    pub fn greet(&self, link: &Address) -> BusResult<()> {
        let me = self.address();
        let nonce = auth::new_nonce();
        let (socket, services) = {
            let mut routes = self.routes();
            let services = routes.services_for(Some(link));
            let slot = routes
                .slot_mut(link)
                .ok_or_else(|| BusError::UnknownAddress(link.to_string()))?;
            slot.nonce = Some(nonce.clone());
            slot.announced = Some(services.clone());
            (Arc::clone(&slot.socket), services)
        };
        socket.send(Frame::Welcome {
            assigned: link.clone(),
            hub: me,
            services: services.into_iter().collect(),
            nonce,
            protocol_version: PROTOCOL_VERSION,
        })
    }

    /// Connecting side: adopt the assigned address, learn the hub's
    /// services and announce our own.
    fn accept_welcome(
        &self,
        link: &Address,
        assigned: Address,
        hub: Address,
        services: Vec<String>,
        nonce: String,
        protocol_version: u32,
    ) {
        if protocol_version != PROTOCOL_VERSION {
            warn!(
                address = %link,
                local = PROTOCOL_VERSION,
                remote = protocol_version,
                "Protocol version mismatch, detaching"
            );
            let _ = self.detach(link);
            return;
        }
        if !self.inner.address_fixed.swap(true, Ordering::SeqCst) {
            *self.inner.address.write().unwrap_or_else(|e| e.into_inner()) = assigned.clone();
            info!(address = %assigned, hub = %hub, "Adopted address assigned by hub");
        }
        let me = self.address();
        let names = parse_services(&services);

        let announce = {
            let mut routes = self.routes();
            let Some(slot) = routes.slot_mut(link) else {
                return;
            };
            slot.peer = Some(hub.clone());
            let socket = Arc::clone(&slot.socket);
            if let Err(e) = routes.set_forwarding(link, &names) {
                warn!(address = %link, error = %e, "Could not record hub services");
            }
            let own = routes.services_for(Some(link));
            if let Some(slot) = routes.slot_mut(link) {
                slot.announced = Some(own.clone());
            }
            (socket, own)
        };

        let (socket, own) = announce;
        let auth_hmac = self
            .inner
            .secret
            .as_deref()
            .map(|secret| auth::sign(secret, &nonce, me.as_str()))
            .unwrap_or_default();
        info!(hub = %hub, link = %link, services = names.len(), "Handshake with hub complete");
        if let Err(e) = socket.send(Frame::Announce {
            address: me,
            services: own.into_iter().collect(),
            auth_hmac,
        }) {
            warn!(hub = %hub, error = %e, "Could not announce to hub");
        }
        self.routes_changed();
    }

    fn accept_announce(
        &self,
        link: &Address,
        address: Address,
        services: Vec<String>,
        auth_hmac: String,
    ) {
        let (first, nonce) = {
            let routes = self.routes();
            let Some(slot) = routes.slot(link) else {
                return;
            };
            (slot.peer.is_none(), slot.nonce.clone())
        };

        if first {
            if let (Some(secret), Some(nonce)) = (self.inner.secret.as_deref(), nonce.as_deref()) {
                if !auth::verify(secret, nonce, address.as_str(), &auth_hmac) {
                    warn!(link = %link, claimed = %address, "Announcement failed authentication");
                    self.expel(link, "authentication failed");
                    return;
                }
            }
        }

        let names = parse_services(&services);
        let changed = {
            let mut routes = self.routes();
            if let Some(slot) = routes.slot_mut(link) {
                slot.peer = Some(address.clone());
            }
            routes.set_forwarding(link, &names).unwrap_or(false)
        };
        if first {
            info!(link = %link, peer = %address, services = names.len(), "Peer handshake complete");
        }
        if changed || first {
            self.routes_changed();
        }
    }

    // ---------------------------------------------------------------------
    // Aging and shutdown
    // ---------------------------------------------------------------------

    /// One aging step: detach sockets idle past the limit, heartbeat the rest.
    pub fn tick(&self) -> Vec<Address> {
        let max_age = self.inner.config.max_socket_age;
        let (expired, live) = {
            let mut routes = self.routes();
            let expired = routes.tick(max_age);
            let live: Vec<Arc<dyn SocketAdapter>> = routes
                .addresses()
                .iter()
                .filter(|a| !expired.contains(*a))
                .filter_map(|a| routes.slot(a).map(|s| Arc::clone(&s.socket)))
                .collect();
            (expired, live)
        };
        for addr in &expired {
            warn!(address = %addr, max_age, "Socket aged out, detaching");
            let _ = self.detach(addr);
        }
        for socket in live {
            let _ = socket.send(Frame::Heartbeat);
        }
        expired
    }

    /// Run [`Directory::tick`] on the configured interval until shutdown.
    pub fn start_aging(&self) -> JoinHandle<()> {
        let dir = self.clone();
        let mut stop = self.inner.shutdown.subscribe();
        let period = self.inner.config.age_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        dir.tick();
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!("Socket aging stopped");
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_shutting_down()
    }

    /// Receiver that flips to `true` when shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    pub fn shutdown_phase(&self) -> ShutdownPhase {
        self.inner.shutdown.current_phase()
    }

    /// Reject pending transactions, say goodbye to every peer and detach
    /// every socket. Idempotent.
    pub fn shutdown(&self, reason: &str) {
        let coordinator = &self.inner.shutdown;
        if !coordinator.initiate(reason) {
            return;
        }
        coordinator.advance_phase(ShutdownPhase::RejectingTransactions, None);

        let settled = self.inner.tracker.reject_all(&BusError::ShuttingDown);
        let rejected = settled.len();
        for s in settled {
            self.handle_settled(s);
        }
        coordinator.advance_phase(
            ShutdownPhase::NotifyingPeers,
            Some(format!("{rejected} transactions rejected")),
        );

        let links: Vec<(Address, Arc<dyn SocketAdapter>)> = {
            let routes = self.routes();
            routes
                .addresses()
                .into_iter()
                .filter_map(|a| routes.slot(&a).map(|s| (a, Arc::clone(&s.socket))))
                .collect()
        };
        for (_, socket) in &links {
            let _ = socket.send(Frame::Goodbye {
                reason: reason.to_string(),
            });
        }
        coordinator.advance_phase(ShutdownPhase::DetachingSockets, None);

        for (addr, _) in &links {
            let _ = self.detach(addr);
        }
        coordinator.advance_phase(
            ShutdownPhase::Complete,
            Some(format!("{} sockets detached", links.len())),
        );
    }
}

fn parse_services(services: &[String]) -> Vec<MessageName> {
    services
        .iter()
        .filter_map(|s| match MessageName::parse(s) {
            Ok(name) => Some(name),
            Err(e) => {
                warn!(error = %e, "Ignoring announced service");
                None
            }
        })
        .collect()
}
