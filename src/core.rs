//! Core: the top-level aggregate that owns the four insertion-ordered
//! lists (globals, clients, nodes, links), the type map, and the factory
//! registry, and exposes the operations a client reaches through resources
//! (`create_node`, `create_link`, `find_port`, `find_node_factory`).
//!
//! Also carries the bootstrap/loop-handle boundary: the two opaque
//! main-loop primitives a host supplies are threaded through here so
//! the rest of the crate never depends on a concrete poll/eventfd
//! implementation.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::access::{Action, AccessHook, AllowAll, Target, Verdict};
use crate::client::{Client, ClientData, ClientId, ClientStore};
use crate::error::{Error, Result};
use crate::format::CapabilitySet;
use crate::global::{BindHook, GlobalRegistry};
use crate::ids::{ObjectId, TypeId, TypeMap};
use crate::link::Link;
use crate::negotiate::negotiate;
use crate::node::{Factory, FactoryRegistry, Node, Properties};
use crate::port::{Direction, Port};
use crate::resource::{self, Resource};

/// Readiness a client has registered interest in, passed to [`LoopHandle`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

/// The opaque main-loop primitive a host supplies: `add_fd`/`update`/
/// `remove` on raw file descriptors with level-triggered readiness. `Core`
/// never polls these itself; it only registers and deregisters against them
/// on behalf of connected clients and the data path. Two instances are
/// given to [`Core::new`] (one for the control loop, one possibly
/// real-time for the data loop), and both stay opaque to the object model
/// (no concrete poll/eventfd implementation is specified
/// here).
pub trait LoopHandle: Send + Sync {
    fn add_fd(&self, fd: RawFd, interest: Interest) -> Result<()>;
    fn update(&self, fd: RawFd, interest: Interest) -> Result<()>;
    fn remove(&self, fd: RawFd) -> Result<()>;
}

/// A `LoopHandle` that does nothing; useful for tests and for embeddings
/// that drive the control and data loops synchronously without real fds.
#[derive(Debug, Default)]
pub struct NullLoopHandle;

impl LoopHandle for NullLoopHandle {
    fn add_fd(&self, _fd: RawFd, _interest: Interest) -> Result<()> {
        Ok(())
    }

    fn update(&self, _fd: RawFd, _interest: Interest) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _fd: RawFd) -> Result<()> {
        Ok(())
    }
}

const TYPE_URI_CORE: &str = "pipecore:core";
const TYPE_URI_CLIENT: &str = "pipecore:client";
const TYPE_URI_NODE: &str = "pipecore:node";
const TYPE_URI_PORT: &str = "pipecore:port";
const TYPE_URI_LINK: &str = "pipecore:link";
const TYPE_URI_FACTORY: &str = "pipecore:factory";

fn null_bind_hook() -> Arc<BindHook> {
    Arc::new(|_resource: &Resource| {})
}

/// The top-level aggregate. Owns every `Global` (by way of
/// [`GlobalRegistry`]), every connected [`Client`], every published `Node`
/// and `Link`, and the [`FactoryRegistry`] that backs `create_node`.
pub struct Core {
    types: TypeMap,
    type_node: TypeId,
    type_port: TypeId,
    type_link: TypeId,
    #[allow(dead_code)]
    type_client: TypeId,
    #[allow(dead_code)]
    type_core: TypeId,
    #[allow(dead_code)]
    type_factory: TypeId,

    globals: GlobalRegistry,
    clients: ClientStore,
    factories: FactoryRegistry,
    access: Arc<dyn AccessHook>,
    #[allow(dead_code)]
    control_loop: Arc<dyn LoopHandle>,
    #[allow(dead_code)]
    data_loop: Arc<dyn LoopHandle>,

    /// Node globals, insertion order.
    nodes: Vec<ObjectId>,
    node_objects: HashMap<ObjectId, Arc<Mutex<Node>>>,
    /// Ports published by any node, insertion order preserved so
    /// `find_port`'s "first match in insertion order" rule is
    /// satisfiable by a plain linear scan.
    ports: Vec<(ObjectId, Arc<Port>)>,
    /// Which port ids belong to which node, so destroying a node can clean
    /// up its ports' globals without re-deriving it from `ports`.
    node_ports: HashMap<ObjectId, Vec<ObjectId>>,
    /// Link globals, insertion order.
    links: Vec<ObjectId>,
    link_objects: HashMap<ObjectId, Arc<Link>>,
}

impl Core {
    pub fn new(control_loop: Arc<dyn LoopHandle>, data_loop: Arc<dyn LoopHandle>, access: Arc<dyn AccessHook>) -> Self {
        let mut types = TypeMap::new();
        let type_core = types.intern(TYPE_URI_CORE);
        let type_client = types.intern(TYPE_URI_CLIENT);
        let type_node = types.intern(TYPE_URI_NODE);
        let type_port = types.intern(TYPE_URI_PORT);
        let type_link = types.intern(TYPE_URI_LINK);
        let type_factory = types.intern(TYPE_URI_FACTORY);

        Self {
            types,
            type_node,
            type_port,
            type_link,
            type_client,
            type_core,
            type_factory,
            globals: GlobalRegistry::new(),
            clients: ClientStore::new(),
            factories: FactoryRegistry::new(),
            access,
            control_loop,
            data_loop,
            nodes: Vec::new(),
            node_objects: HashMap::new(),
            ports: Vec::new(),
            node_ports: HashMap::new(),
            links: Vec::new(),
            link_objects: HashMap::new(),
        }
    }

    /// A `Core` wired to [`NullLoopHandle`]s and the [`AllowAll`] access
    /// policy, for tests and embeddings that drive everything synchronously.
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(NullLoopHandle), Arc::new(NullLoopHandle), Arc::new(AllowAll))
    }

    pub fn types(&self) -> &TypeMap {
        &self.types
    }

    pub fn register_factory(&mut self, name: impl Into<String>, factory: Arc<dyn Factory>) {
        self.factories.register(name, factory);
    }

    pub fn find_node_factory(&self, name: &str) -> Result<Arc<dyn Factory>> {
        self.factories.get(name).cloned()
    }

    pub fn connect_client(&mut self, data: Arc<dyn ClientData>) -> ClientId {
        let id = self.clients.connect(data);
        debug!("client {} connected", id.as_u32());
        id
    }

    /// Disconnects a client, dropping every resource it held. Globals the
    /// client owned are left untouched; ownership is orthogonal to binding
    /// (a client may own globals other clients bind, and vice versa).
    pub fn disconnect_client(&mut self, id: ClientId) {
        if self.clients.disconnect(id).is_some() {
            debug!("client {} disconnected", id.as_u32());
        }
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Binds `client` to the global `global_id`. See [`resource::bind`]
    /// for the exact error ordering (version, access, id collision).
    pub fn bind(&mut self, client: ClientId, global_id: ObjectId, requested_version: u32, local_id: u32) -> Result<Resource> {
        let resource = resource::bind(
            &self.globals,
            &mut self.clients,
            self.access.as_ref(),
            global_id,
            client,
            requested_version,
            local_id,
        )?;
        debug!("client {} bound global {} as local id {}", client.as_u32(), global_id, local_id);
        Ok(resource)
    }

    pub fn global_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.globals.iter().map(|g| g.id())
    }

    /// The ids of the ports published for a given node, in the order the
    /// factory attached them. A caller that just created a node (or is
    /// watching the registry) uses this to learn the port ids it can pass
    /// to [`Self::create_link`] or [`Self::find_port`].
    pub fn ports_of(&self, node_id: ObjectId) -> Option<&[ObjectId]> {
        self.node_ports.get(&node_id).map(Vec::as_slice)
    }

    /// Creates a node from a registered factory and publishes it, then
    /// publishes every port the factory attached to it: a client publishes
    /// a node, the node publishes ports, the core adds a global for each.
    /// `owner = None` means server-owned.
    pub fn create_node(&mut self, owner: Option<ClientId>, factory_name: &str, props: Properties) -> Result<ObjectId> {
        if let Some(client) = owner {
            self.check_access(client, Action::CreateNode, Target(None))?;
        }

        let factory = self.factories.get(factory_name)?.clone();
        let node = factory.create(props)?;
        let port_count = node.ports().len();
        let ports: Vec<Arc<Port>> = node.ports().to_vec();
        let node_arc = Arc::new(Mutex::new(node));

        let node_id = self.globals.add_global(owner, self.type_node, 1, node_arc.clone(), null_bind_hook());
        node_arc.lock().set_id(node_id);
        self.nodes.push(node_id);
        self.node_objects.insert(node_id, node_arc);
        debug!("node {} created from factory '{}' ({} ports)", node_id, factory_name, port_count);

        let mut port_ids = Vec::with_capacity(ports.len());
        for port in ports {
            let port_id = self.globals.add_global(owner, self.type_port, 1, port.clone(), null_bind_hook());
            self.ports.push((port_id, port));
            port_ids.push(port_id);
            debug!("port {} published for node {}", port_id, node_id);
        }
        self.node_ports.insert(node_id, port_ids);

        Ok(node_id)
    }

    /// Creates a link between the ports identified by `output_id`/`input_id`
    /// (order-independent; normalized by direction) and publishes it.
    ///
    /// Negotiates *before* constructing the `Link`, so an
    /// `IncompatibleFormats` failure registers no callback on either port
    /// and publishes no global, unlike the historical source's
    /// unconditional cross-wiring at construction time (see
    /// [`crate::link::Link::seed_cross_constraints`]).
    pub fn create_link(
        &mut self,
        owner: Option<ClientId>,
        output_id: ObjectId,
        input_id: ObjectId,
        filter: Vec<CapabilitySet>,
    ) -> Result<ObjectId> {
        if let Some(client) = owner {
            self.check_access(client, Action::CreateLink, Target(Some(output_id)))?;
        }

        let a = self.port_by_id(output_id).ok_or(Error::NotFound("port"))?;
        let b = self.port_by_id(input_id).ok_or(Error::NotFound("port"))?;

        let (output, input) = Link::normalize(a, b)?;
        let chosen = negotiate(&output.possible_formats(), &input.possible_formats(), &filter)?;

        let link = Link::new(output, input, filter)?;
        link.commit_format(chosen);

        let link_id = self.globals.add_global(owner, self.type_link, 1, link.clone(), null_bind_hook());
        self.links.push(link_id);
        self.link_objects.insert(link_id, link.clone());
        link.activate();
        debug!("link {} created ({} -> {})", link_id, output_id, input_id);

        Ok(link_id)
    }

    /// Resolves a peer port for `hint_port` when the caller does not name
    /// one explicitly: searches nodes matching `props`, in insertion order,
    /// and within each matching node every port of the opposite direction
    /// (also in insertion order), picking the first whose `possible_formats`
    /// intersects non-emptily with `hint_port`'s and every filter.
    pub fn find_port(&self, hint_port: ObjectId, props: &Properties, filters: &[CapabilitySet]) -> Result<ObjectId> {
        let hint = self.port_by_id(hint_port).ok_or(Error::NotFound("port"))?;
        let want_direction = match hint.direction() {
            Direction::Input => Direction::Output,
            Direction::Output => Direction::Input,
        };

        for node_id in &self.nodes {
            let Some(node_arc) = self.node_objects.get(node_id) else { continue };
            let node = node_arc.lock();
            if !node.matches(props) {
                continue;
            }

            for candidate in node.available_ports(want_direction) {
                let mut set = (*candidate.possible_formats()).clone();
                set = set.intersect(&hint.possible_formats());
                for filter in filters {
                    set = set.intersect(filter);
                }
                if set.is_empty() {
                    continue;
                }

                if let Some(id) = self.port_id_of(candidate) {
                    return Ok(id);
                }
            }
        }

        Err(Error::NotFound("port"))
    }

    fn port_by_id(&self, id: ObjectId) -> Option<Arc<Port>> {
        self.ports.iter().find(|(pid, _)| *pid == id).map(|(_, p)| p.clone())
    }

    /// Links whose output or input port is one of `port_ids`. A `Link`
    /// unwinds its own state when one of its ports announces `destroyed`
    /// (`Link::wire`'s subscription), but that leaves `Core`'s own
    /// bookkeeping (the link's `Global`, `links`, `link_objects`) unaware;
    /// `destroy_node` uses this to find and destroy them explicitly instead
    /// of leaving a stale global behind.
    fn links_referencing(&self, port_ids: &[ObjectId]) -> Vec<ObjectId> {
        let ports: Vec<Arc<Port>> = port_ids.iter().filter_map(|id| self.port_by_id(*id)).collect();
        self.link_objects
            .iter()
            .filter(|(_, link)| ports.iter().any(|p| Arc::ptr_eq(p, link.output()) || Arc::ptr_eq(p, link.input())))
            .map(|(id, _)| *id)
            .collect()
    }

    fn port_id_of(&self, port: &Arc<Port>) -> Option<ObjectId> {
        self.ports.iter().find(|(_, p)| Arc::ptr_eq(p, port)).map(|(id, _)| *id)
    }

    fn check_access(&self, client: ClientId, action: Action, target: Target) -> Result<()> {
        match self.access.check(client, action, target) {
            Verdict::Allow => Ok(()),
            Verdict::Deny(reason) => Err(Error::AccessDenied(reason)),
        }
    }

    /// Destroys the link identified by `id`: tears down its state machine
    /// (its `remove` method) and then its global. Idempotent; returns whether a
    /// link with that id existed.
    pub fn destroy_link(&mut self, id: ObjectId) -> bool {
        let Some(link) = self.link_objects.remove(&id) else { return false };
        self.links.retain(|lid| *lid != id);
        link.remove();
        self.globals.destroy(id, &mut self.clients);
        debug!("link {} destroyed", id);
        true
    }

    /// Destroys the node identified by `id`: destroys any link still
    /// attached to one of its ports (this also cascades
    /// through each affected link's own `on_destroyed`-triggered unwind, but
    /// `Core` removes the link's global and bookkeeping itself rather than
    /// rely on that to notice), then tears down every port the node owns,
    /// then their globals, then the node's own global. Idempotent; returns
    /// whether a node with that id existed.
    pub fn destroy_node(&mut self, id: ObjectId) -> bool {
        let Some(node_arc) = self.node_objects.remove(&id) else { return false };
        self.nodes.retain(|nid| *nid != id);

        if let Some(port_ids) = self.node_ports.get(&id).cloned() {
            for link_id in self.links_referencing(&port_ids) {
                self.destroy_link(link_id);
            }
        }

        node_arc.lock().destroy_ports();

        if let Some(port_ids) = self.node_ports.remove(&id) {
            for port_id in port_ids {
                self.ports.retain(|(pid, _)| *pid != port_id);
                self.globals.destroy(port_id, &mut self.clients);
            }
        }

        self.globals.destroy(id, &mut self.clients);
        debug!("node {} destroyed", id);
        true
    }

    /// Destroys whatever global `id` names (link, node, or a plain global),
    /// per the bus-facing `Core::destroy(id)` method. Returns whether
    /// anything existed at that id.
    pub fn destroy(&mut self, id: ObjectId) -> bool {
        if self.link_objects.contains_key(&id) {
            self.destroy_link(id)
        } else if self.node_objects.contains_key(&id) {
            self.destroy_node(id)
        } else if self.globals.contains(id) {
            self.globals.destroy(id, &mut self.clients);
            true
        } else {
            false
        }
    }

    /// Tears the whole core down: links first (stopping the data path),
    /// then nodes, then clients, then whatever globals remain (reverse of
    /// insertion order within each class). After this, no send or receive
    /// callback executes again.
    pub fn shutdown(&mut self) {
        for link_id in self.links.clone().into_iter().rev() {
            self.destroy_link(link_id);
        }
        for node_id in self.nodes.clone().into_iter().rev() {
            self.destroy_node(node_id);
        }
        let client_ids: Vec<ClientId> = self.clients.iter().map(Client::id).collect();
        for client_id in client_ids.into_iter().rev() {
            self.disconnect_client(client_id);
        }
        let remaining: Vec<ObjectId> = self.globals.iter().map(|g| g.id()).collect();
        for global_id in remaining.into_iter().rev() {
            self.globals.destroy(global_id, &mut self.clients);
        }
        debug!("core shutdown complete");
    }
}
