//! Per-client state: connection identity, and its table of bound resources.

use std::collections::HashMap;
use std::sync::Arc;

use crate::resource::Resource;

/// Identifies a connected client. Stable for the lifetime of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(u32);

impl ClientId {
    pub fn from_raw(raw: u32) -> Self {
        ClientId(raw)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Notified of lifecycle events for the client it is attached to. Mirrors
/// the historical object system's per-client user data, without requiring
/// the core to know anything about IPC transport.
pub trait ClientData: Send + Sync {
    fn disconnected(&self, _client: ClientId) {}
}

/// The default, silent client payload.
#[derive(Debug, Default)]
pub struct NoClientData;

impl ClientData for NoClientData {}

/// A connected client: its identity, its opaque user payload, and the
/// table of resources it has bound. A resource is the only way a client
/// observes or mutates a global.
pub struct Client {
    id: ClientId,
    data: Arc<dyn ClientData>,
    resources: HashMap<u32, Resource>,
}

impl Client {
    pub fn new(id: ClientId, data: Arc<dyn ClientData>) -> Self {
        Self { id, data, resources: HashMap::new() }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn has_resource(&self, local_id: u32) -> bool {
        self.resources.contains_key(&local_id)
    }

    pub fn insert_resource(&mut self, local_id: u32, resource: Resource) {
        self.resources.insert(local_id, resource);
    }

    pub fn resource(&self, local_id: u32) -> Option<&Resource> {
        self.resources.get(&local_id)
    }

    pub fn remove_resource(&mut self, local_id: u32) -> Option<Resource> {
        self.resources.remove(&local_id)
    }

    /// Removes every resource bound to `global`, returning how many were
    /// removed. Used by [`crate::global::Global::destroy`] to invalidate
    /// borrowers before the global itself is torn down.
    pub(crate) fn remove_resources_of(&mut self, global: crate::ids::ObjectId) -> usize {
        let before = self.resources.len();
        self.resources.retain(|_, res| res.global_id() != global);
        before - self.resources.len()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

/// The insertion-ordered list of connected clients, one of the four lists
/// `Core` owns.
#[derive(Default)]
pub struct ClientStore {
    order: Vec<ClientId>,
    clients: HashMap<ClientId, Client>,
    next_id: u32,
}

impl ClientStore {
    pub fn new() -> Self {
        Self { order: Vec::new(), clients: HashMap::new(), next_id: 0 }
    }

    pub fn connect(&mut self, data: Arc<dyn ClientData>) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        self.order.push(id);
        self.clients.insert(id, Client::new(id, data));
        id
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    /// Disconnects a client, notifying its `ClientData` and dropping its
    /// resource table. Returns the removed client, if it existed.
    pub fn disconnect(&mut self, id: ClientId) -> Option<Client> {
        self.order.retain(|cid| *cid != id);
        let client = self.clients.remove(&id);
        if let Some(ref client) = client {
            client.data.disconnected(id);
        }
        client
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.order.iter().filter_map(move |id| self.clients.get(id))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Client> {
        // Order is not semantically required for mutation passes (e.g.
        // invalidating resources on global destruction); iterate the map
        // directly to avoid a double lookup per client.
        self.clients.values_mut()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_and_disconnect() {
        let mut store = ClientStore::new();
        let id = store.connect(Arc::new(NoClientData));
        assert!(store.get(id).is_some());
        assert_eq!(store.len(), 1);
        let removed = store.disconnect(id);
        assert!(removed.is_some());
        assert!(store.get(id).is_none());
        assert_eq!(store.len(), 0);
    }
}
