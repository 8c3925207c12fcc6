//! Global registry: publishes objects as `global`s and notifies
//! observers synchronously, before `add_global`/`destroy` return.

use std::sync::Arc;

use downcast_rs::DowncastSync;

use crate::client::{Client, ClientId};
use crate::ids::{ObjectId, ObjectMap, TypeId};
use crate::resource::Resource;
use crate::signal::Signal;

/// Marker for the opaque handle a `Global` keeps back to its concrete
/// entity (a `Node`, `Port`, `Link`, ...). Downcasting lets a caller that
/// already knows the concrete type recover it; nothing in this crate
/// downcasts across module boundaries except the resource binder.
pub trait GlobalObject: DowncastSync {}
downcast_rs::impl_downcast!(sync GlobalObject);

/// Invoked once a `Resource` has been constructed for a successful bind, so
/// the concrete object can install per-resource dispatch. Cannot fail:
/// version and access checks already ran in [`crate::resource::bind`].
pub type BindHook = dyn Fn(&Resource) + Send + Sync;

/// One publicly visible object. `Core` owns every `Global`
/// exclusively; the global shares ownership of `object` with whatever
/// published it.
pub struct Global {
    id: ObjectId,
    type_id: TypeId,
    version: u32,
    owner: Option<ClientId>,
    object: Arc<dyn GlobalObject>,
    bind: Arc<BindHook>,
    destroy_signal: Signal<ObjectId>,
}

impl Global {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn owner(&self) -> Option<ClientId> {
        self.owner
    }

    pub fn object(&self) -> &Arc<dyn GlobalObject> {
        &self.object
    }

    pub fn bind_hook(&self) -> &Arc<BindHook> {
        &self.bind
    }

    /// Subscribes to this global's destruction. Fired before any resource
    /// referencing this global is removed.
    pub fn on_destroy<F>(&self, f: F) -> crate::signal::SignalHandle<ObjectId>
    where
        F: FnMut(&ObjectId) + Send + 'static,
    {
        self.destroy_signal.connect(f)
    }
}

/// A notification that a global was added or removed, for registry
/// observers (the bus-facing `Registry` object a host exposes is built on top of
/// this).
#[derive(Clone, Copy, Debug)]
pub enum GlobalEvent {
    Added { id: ObjectId, type_id: TypeId, version: u32 },
    Removed { id: ObjectId },
}

/// The insertion-ordered registry of every published `Global`, plus the
/// backing object map that the rest of the crate treats as `core.objects`.
#[derive(Default)]
pub struct GlobalRegistry {
    objects: ObjectMap<Global>,
    order: Vec<ObjectId>,
    on_event: Signal<GlobalEvent>,
}

impl GlobalRegistry {
    pub fn new() -> Self {
        Self { objects: ObjectMap::new(), order: Vec::new(), on_event: Signal::new() }
    }

    /// Subscribes to every `global_added`/`global_removed` event.
    pub fn watch<F>(&self, f: F) -> crate::signal::SignalHandle<GlobalEvent>
    where
        F: FnMut(&GlobalEvent) + Send + 'static,
    {
        self.on_event.connect(f)
    }

    /// Publishes `object` as a new global. Observers registered via
    /// [`watch`](Self::watch) are notified synchronously before this
    /// returns.
    pub fn add_global(
        &mut self,
        owner: Option<ClientId>,
        type_id: TypeId,
        version: u32,
        object: Arc<dyn GlobalObject>,
        bind: Arc<BindHook>,
    ) -> ObjectId {
        let id = self.objects.insert_with(|id| Global {
            id,
            type_id,
            version,
            owner,
            object,
            bind,
            destroy_signal: Signal::new(),
        });
        self.order.push(id);
        self.on_event.emit(&GlobalEvent::Added { id, type_id, version });
        id
    }

    pub fn get(&self, id: ObjectId) -> Option<&Global> {
        self.objects.get(id)
    }

    /// Destroys the global identified by `id`: emits its `destroy_signal`,
    /// invalidates every resource any client holds onto it, then removes it
    /// from the registry and the object map.
    ///
    /// Safe to call from within a `watch` observer for a *different* global
    /// than the one currently being notified; `order` is snapshotted by
    /// value where iteration would otherwise be invalidated by removal.
    pub fn destroy(&mut self, id: ObjectId, clients: &mut crate::client::ClientStore) -> usize {
        let Some(global) = self.objects.get(id) else { return 0 };
        global.destroy_signal.emit(&id);

        let mut invalidated = 0;
        for client in clients.iter_mut() {
            invalidated += client.remove_resources_of(id);
        }

        self.objects.remove(id);
        self.order.retain(|gid| *gid != id);
        self.on_event.emit(&GlobalEvent::Removed { id });
        invalidated
    }

    /// Iterates globals in insertion order. Snapshotting `order` up front
    /// makes this safe against a visitor destroying globals other than the
    /// one currently visited.
    pub fn iter(&self) -> impl Iterator<Item = &Global> {
        let snapshot = self.order.clone();
        snapshot.into_iter().filter_map(move |id| self.objects.get(id))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AllowAll;
    use crate::client::NoClientData;
    use crate::ids::TypeMap;
    use std::sync::Mutex as StdMutex;

    struct Dummy;
    impl GlobalObject for Dummy {}

    fn a_type() -> TypeId {
        TypeMap::new().intern("pipecore:test")
    }

    #[test]
    fn add_global_notifies_watchers_before_returning() {
        let mut registry = GlobalRegistry::new();
        let events: Arc<StdMutex<Vec<GlobalEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let e = events.clone();
        let _handle = registry.watch(move |ev| e.lock().unwrap().push(*ev));

        let id = registry.add_global(None, a_type(), 3, Arc::new(Dummy), Arc::new(|_| {}));

        let recorded = events.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        match recorded[0] {
            GlobalEvent::Added { id: eid, version, .. } => {
                assert_eq!(eid, id);
                assert_eq!(version, 3);
            }
            _ => panic!("expected Added event"),
        }
    }

    #[test]
    fn destroy_fires_destroy_signal_and_global_removed_then_forgets_the_id() {
        let mut registry = GlobalRegistry::new();
        let mut clients = crate::client::ClientStore::new();
        let id = registry.add_global(None, a_type(), 1, Arc::new(Dummy), Arc::new(|_| {}));

        let destroyed = Arc::new(StdMutex::new(false));
        let d = destroyed.clone();
        let _handle = registry.get(id).unwrap().on_destroy(move |_| *d.lock().unwrap() = true);

        let events: Arc<StdMutex<Vec<GlobalEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let e = events.clone();
        let _watch = registry.watch(move |ev| e.lock().unwrap().push(*ev));

        registry.destroy(id, &mut clients);

        assert!(*destroyed.lock().unwrap());
        assert!(!registry.contains(id));
        assert!(matches!(events.lock().unwrap().last(), Some(GlobalEvent::Removed { id: rid }) if *rid == id));
    }

    #[test]
    fn destroying_a_global_invalidates_every_resource_bound_to_it() {
        let mut registry = GlobalRegistry::new();
        let mut clients = crate::client::ClientStore::new();
        let client_id = clients.connect(Arc::new(NoClientData));

        let id = registry.add_global(None, a_type(), 1, Arc::new(Dummy), Arc::new(|_| {}));
        crate::resource::bind(&registry, &mut clients, &AllowAll, id, client_id, 1, 9).unwrap();
        assert!(clients.get(client_id).unwrap().has_resource(9));

        let invalidated = registry.destroy(id, &mut clients);
        assert_eq!(invalidated, 1);
        assert!(!clients.get(client_id).unwrap().has_resource(9));
    }

    #[test]
    fn destroying_an_unknown_id_is_a_harmless_no_op() {
        let mut registry = GlobalRegistry::new();
        let mut clients = crate::client::ClientStore::new();
        let bogus = registry.add_global(None, a_type(), 1, Arc::new(Dummy), Arc::new(|_| {}));
        registry.destroy(bogus, &mut clients);

        assert_eq!(registry.destroy(bogus, &mut clients), 0);
    }

    #[test]
    fn iter_snapshots_insertion_order_up_front() {
        let mut registry = GlobalRegistry::new();
        let first = registry.add_global(None, a_type(), 1, Arc::new(Dummy), Arc::new(|_| {}));
        let second = registry.add_global(None, a_type(), 1, Arc::new(Dummy), Arc::new(|_| {}));
        let third = registry.add_global(None, a_type(), 1, Arc::new(Dummy), Arc::new(|_| {}));

        let ids: Vec<ObjectId> = registry.iter().map(|g| g.id()).collect();
        assert_eq!(ids, vec![first, second, third]);
    }
}
