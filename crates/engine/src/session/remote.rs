//! Remote client sessions
//!
//! A remote client keeps its own identity map mirroring the objects it has
//! read from a server session. Reads refresh the mirror from the server
//! (RefreshRemote); commits are validated and applied by the server first,
//! then the same change set is merged into the mirror (CommitToRemote).

use coherence_core::{CacheKey, CoherenceResult, EntityObject, ObjectSpace};
use std::sync::Arc;

use super::Session;
use crate::merge::{MergeManager, MergePolicy, MergeSource, MergeSummary, MergeTarget};
use crate::unit_of_work::UnitOfWork;

/// Client-side mirror of a server session
#[derive(Debug, Clone)]
pub struct RemoteSession {
    server: Session,
    mirror: Session,
}

impl RemoteSession {
    /// Mirror of `server` with the server's descriptors
    ///
    /// # Errors
    ///
    /// `Config` if the server's configuration is rejected for the mirror.
    pub fn new(server: Session) -> CoherenceResult<Self> {
        let mirror = Session::builder()
            .config(server.config().clone())
            .server(server.clone())
            .build()?;
        Ok(Self { server, mirror })
    }

    /// Server session
    pub fn server(&self) -> &Session {
        &self.server
    }

    /// Client-side session over the mirror cache
    pub fn mirror(&self) -> &Session {
        &self.mirror
    }

    /// Mirror object for `key`, read through the server if not mirrored
    pub fn read_object(&self, key: &CacheKey) -> CoherenceResult<Option<Arc<EntityObject>>> {
        self.mirror.read_original(key)
    }

    /// Refresh the mirror from server objects
    ///
    /// Every object reachable from `roots` in the server cache is merged
    /// into the mirror with the server's lock values.
    pub fn refresh_remote(&self, roots: &[Arc<EntityObject>]) -> CoherenceResult<MergeSummary> {
        let space: &dyn ObjectSpace = self.server.cache().as_ref();
        let mut merge = MergeManager::new(
            &self.mirror,
            MergePolicy::RefreshRemote,
            MergeSource::Objects(space),
            MergeTarget::SharedCache,
        )?;
        for root in roots {
            merge.merge(Some(root.id()))?;
        }
        merge.finish()
    }

    /// Unit of work over the mirror
    pub fn acquire_unit_of_work(&self) -> UnitOfWork {
        self.mirror.acquire_unit_of_work()
    }

    /// Commit `unit_of_work` to the server, then align the mirror
    pub fn commit_to_remote(&self, unit_of_work: &mut UnitOfWork) -> CoherenceResult<MergeSummary> {
        unit_of_work.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::EntityDescriptor;
    use coherence_core::{Attributes, ObjectSpace, PrimaryKey, Value};

    fn server() -> Session {
        Session::builder()
            .descriptor(
                EntityDescriptor::builder("Account")
                    .primary_key(["id"])
                    .direct("id")
                    .direct("balance")
                    .version_locking("version")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    fn seed(server: &Session, id: i64, balance: i64) -> Arc<EntityObject> {
        let mut uow = server.acquire_unit_of_work();
        let mut state = Attributes::new();
        state.insert("id".into(), Value::Int(id));
        state.insert("balance".into(), Value::Int(balance));
        let object = uow
            .register_new_object(EntityObject::new("Account", state))
            .unwrap();
        uow.commit().unwrap();
        let key = CacheKey::new("Account", PrimaryKey::int(id));
        let original = server.cache().lookup(&key).unwrap();
        assert_ne!(original.id(), object.id());
        original
    }

    #[test]
    fn test_refresh_remote_mirrors_lock_value() {
        let server = server();
        let original = seed(&server, 1, 100);
        let remote = RemoteSession::new(server.clone()).unwrap();

        let summary = remote.refresh_remote(&[Arc::clone(&original)]).unwrap();
        assert_eq!(summary.merged, 1);

        let key = CacheKey::new("Account", PrimaryKey::int(1));
        let mirrored = remote.mirror().cache().lookup_entry(&key).unwrap();
        let server_entry = server.cache().lookup_entry(&key).unwrap();
        assert_eq!(mirrored.write_lock_value(), server_entry.write_lock_value());
        assert_ne!(mirrored.object().unwrap().id(), original.id());
        assert!(remote.mirror().resolve(original.id()).is_none());
    }

    #[test]
    fn test_commit_to_remote_updates_server_then_mirror() {
        let server = server();
        seed(&server, 2, 50);
        let remote = RemoteSession::new(server.clone()).unwrap();
        let key = CacheKey::new("Account", PrimaryKey::int(2));

        let mut uow = remote.acquire_unit_of_work();
        let clone = uow.read_object(&key).unwrap().unwrap();
        uow.set_attribute(clone.id(), "balance", Value::Int(75)).unwrap();
        remote.commit_to_remote(&mut uow).unwrap();

        let on_server = server.cache().lookup(&key).unwrap();
        let on_mirror = remote.mirror().cache().lookup(&key).unwrap();
        assert_eq!(on_server.get("balance"), Some(Value::Int(75)));
        assert_eq!(on_mirror.get("balance"), Some(Value::Int(75)));
        assert_eq!(
            server.cache().lookup_entry(&key).unwrap().write_lock_value(),
            remote.mirror().cache().lookup_entry(&key).unwrap().write_lock_value()
        );
    }
}
