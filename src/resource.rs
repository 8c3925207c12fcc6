//! Resource binder: per-client handles onto globals with version
//! negotiation.

use crate::access::{Action, AccessHook, Target, Verdict};
use crate::client::{ClientId, ClientStore};
use crate::error::{Error, Result};
use crate::global::GlobalRegistry;
use crate::ids::ObjectId;

/// A per-client materialization of a [`crate::global::Global`]. The
/// only way a client observes or mutates a global.
#[derive(Clone, Debug)]
pub struct Resource {
    client: ClientId,
    global: ObjectId,
    local_id: u32,
    version: u32,
}

impl Resource {
    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn global_id(&self) -> ObjectId {
        self.global
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

/// Binds `client` to the global `global_id`, at `requested_version`, under
/// `local_id`. Checks version, then access, then id collision, in that order.
pub fn bind(
    registry: &GlobalRegistry,
    clients: &mut ClientStore,
    access: &dyn AccessHook,
    global_id: ObjectId,
    client_id: ClientId,
    requested_version: u32,
    local_id: u32,
) -> Result<Resource> {
    let global = registry.get(global_id).ok_or(Error::NotFound("global"))?;

    if requested_version > global.version() {
        return Err(Error::VersionUnsupported { requested: requested_version, available: global.version() });
    }

    match access.check(client_id, Action::Bind, Target(Some(global_id))) {
        Verdict::Allow => {}
        Verdict::Deny(reason) => return Err(Error::AccessDenied(reason)),
    }

    let client = clients.get_mut(client_id).ok_or(Error::NotFound("client"))?;
    if client.has_resource(local_id) {
        return Err(Error::IdInUse(local_id));
    }

    let resource = Resource { client: client_id, global: global_id, local_id, version: requested_version };
    (global.bind_hook())(&resource);
    client.insert_resource(local_id, resource.clone());
    Ok(resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AllowAll;
    use crate::client::NoClientData;
    use crate::ids::TypeId;
    use std::sync::Arc;

    struct Dummy;
    impl crate::global::GlobalObject for Dummy {}

    fn setup() -> (GlobalRegistry, ClientStore, ObjectId, ClientId) {
        let mut registry = GlobalRegistry::new();
        let mut clients = ClientStore::new();
        let mut types = crate::ids::TypeMap::new();
        let type_id: TypeId = types.intern("pipecore:node");
        let global_id =
            registry.add_global(None, type_id, 3, Arc::new(Dummy), Arc::new(|_: &Resource| {}));
        let client_id = clients.connect(Arc::new(NoClientData));
        (registry, clients, global_id, client_id)
    }

    #[test]
    fn bind_succeeds_within_version() {
        let (registry, mut clients, global_id, client_id) = setup();
        let access = AllowAll;
        let resource = bind(&registry, &mut clients, &access, global_id, client_id, 2, 10).unwrap();
        assert_eq!(resource.version(), 2);
        assert!(clients.get(client_id).unwrap().has_resource(10));
    }

    #[test]
    fn bind_rejects_newer_version() {
        let (registry, mut clients, global_id, client_id) = setup();
        let access = AllowAll;
        let err = bind(&registry, &mut clients, &access, global_id, client_id, 4, 10).unwrap_err();
        assert_eq!(err, Error::VersionUnsupported { requested: 4, available: 3 });
        assert_eq!(clients.get(client_id).unwrap().resource_count(), 0);
    }

    #[test]
    fn bind_rejects_duplicate_local_id() {
        let (registry, mut clients, global_id, client_id) = setup();
        let access = AllowAll;
        bind(&registry, &mut clients, &access, global_id, client_id, 1, 10).unwrap();
        let err = bind(&registry, &mut clients, &access, global_id, client_id, 1, 10).unwrap_err();
        assert_eq!(err, Error::IdInUse(10));
    }
}
