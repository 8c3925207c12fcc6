//! Node / factory layer: the published entity that owns ports, and the
//! named constructors that produce one.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::global::GlobalObject;
use crate::ids::ObjectId;
use crate::port::{Direction, Port};

/// A node's free-form property bag, matched against by `create_node` and
/// `find_port`.
pub type Properties = HashMap<String, String>;

/// A published entity that owns one or more ports. Ports are destroyed (in
/// reverse creation order) when the node itself is destroyed, which tears
/// down any link still referencing them through the normal port-destruction
/// path.
pub struct Node {
    id: ObjectId,
    factory_name: String,
    props: Properties,
    ports: Vec<Arc<Port>>,
}

impl GlobalObject for Node {}
impl GlobalObject for parking_lot::Mutex<Node> {}

impl Node {
    pub fn new(id: ObjectId, factory_name: impl Into<String>, props: Properties) -> Self {
        Self { id, factory_name: factory_name.into(), props, ports: Vec::new() }
    }

    /// Builds a node with no id yet allocated. Factories use this: they run
    /// before `Core::create_node` has published anything, so there is no
    /// real id to give them. `Core::create_node` calls [`Self::set_id`]
    /// immediately after the node's `Global` is added.
    pub fn new_unpublished(factory_name: impl Into<String>, props: Properties) -> Self {
        Self::new(ObjectId::placeholder(), factory_name, props)
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Overwrites this node's id once `Core::create_node` knows the real
    /// one allocated for its `Global`. A factory builds a `Node` before
    /// that id exists, so it constructs one with a throwaway id first.
    pub(crate) fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    pub fn factory_name(&self) -> &str {
        &self.factory_name
    }

    pub fn properties(&self) -> &Properties {
        &self.props
    }

    pub fn matches(&self, query: &Properties) -> bool {
        query.iter().all(|(k, v)| self.props.get(k) == Some(v))
    }

    pub fn add_port(&mut self, port: Arc<Port>) {
        self.ports.push(port);
    }

    pub fn ports(&self) -> &[Arc<Port>] {
        &self.ports
    }

    /// Every port matching `direction`, not already linked unless it allows
    /// fan-out, in creation order. `Core::find_port` tries each in turn
    /// rather than stopping at the first, since a node may own several ports
    /// of the same direction and only one of them might intersect the
    /// requested capability set.
    pub fn available_ports(&self, direction: Direction) -> impl Iterator<Item = &Arc<Port>> {
        self.ports.iter().filter(move |p| p.direction() == direction && (!p.is_linked() || p.fanout_allowed()))
    }

    /// Tears down every port (deactivating any still active) in reverse
    /// creation order, then drops them. Any link still referencing a port
    /// unwinds through that port's `on_destroyed` signal.
    pub fn destroy_ports(&mut self) {
        while let Some(port) = self.ports.pop() {
            port.prepare_destroy();
            port.notify_destroyed();
        }
    }
}

/// A named constructor that produces a `Node` given its properties. The
/// plugin ABI used to load a factory's backing implementation from a shared
/// object is out of scope; only this in-process boundary is specified.
pub trait Factory: Send + Sync {
    fn create(&self, props: Properties) -> Result<Node>;
}

impl<F> Factory for F
where
    F: Fn(Properties) -> Result<Node> + Send + Sync,
{
    fn create(&self, props: Properties) -> Result<Node> {
        self(props)
    }
}

/// The registry of factories a host has installed ahead of time.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, Arc<dyn Factory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn Factory>) {
        self.factories.insert(name.into(), factory);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Factory>> {
        self.factories.get(name).ok_or(Error::NotFound("node factory"))
    }
}
