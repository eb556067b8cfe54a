//! Session builder for fluent configuration

use coherence_cache::IdentityMap;
use coherence_concurrency::WriteLockCoordinator;
use coherence_core::{CoherenceResult, DataSource, EmptyDataSource, SessionId};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{Session, SessionInner};
use crate::config::CoherenceConfig;
use crate::descriptor::{DescriptorRegistry, EntityDescriptor};
use crate::events::{EventHooks, MergeListener};
use crate::metrics::MergeMetrics;
use crate::sequencing::Sequencing;

// ============================================================================
// Session Builder Pattern
// ============================================================================

/// Builder for [`Session`]
///
/// ```ignore
/// use coherence_engine::{CoherenceConfig, EntityDescriptor, Session};
///
/// // In code
/// let session = Session::builder()
///     .descriptor(employee_descriptor)
///     .data_source(Arc::new(rows))
///     .build()?;
///
/// // From coherence.toml
/// let session = Session::builder()
///     .config_file("coherence.toml")?
///     .descriptor(employee_descriptor)
///     .build()?;
/// ```
pub struct SessionBuilder {
    config: CoherenceConfig,
    descriptors: DescriptorRegistry,
    data_source: Option<Arc<dyn DataSource>>,
    cache: Option<Arc<IdentityMap>>,
    events: EventHooks,
    server: Option<Session>,
}

impl SessionBuilder {
    /// Create new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: CoherenceConfig::default(),
            descriptors: DescriptorRegistry::new(),
            data_source: None,
            cache: None,
            events: EventHooks::new(),
            server: None,
        }
    }

    /// Use `config`
    pub fn config(mut self, config: CoherenceConfig) -> Self {
        self.config = config;
        self
    }

    /// Load the configuration from a TOML file
    ///
    /// # Errors
    ///
    /// `Config` if the file cannot be read or holds invalid settings.
    pub fn config_file(mut self, path: impl AsRef<Path>) -> CoherenceResult<Self> {
        self.config = CoherenceConfig::from_file(path.as_ref())?;
        Ok(self)
    }

    /// Register one descriptor
    pub fn descriptor(mut self, descriptor: EntityDescriptor) -> Self {
        self.descriptors.register(descriptor);
        self
    }

    /// Use a prepared descriptor registry, replacing registered descriptors
    pub fn descriptors(mut self, descriptors: DescriptorRegistry) -> Self {
        self.descriptors = descriptors;
        self
    }

    /// Read rows from `data_source`; defaults to a source with no rows
    pub fn data_source(mut self, data_source: Arc<dyn DataSource>) -> Self {
        self.data_source = Some(data_source);
        self
    }

    /// Use an existing identity map instead of a fresh one
    pub fn cache(mut self, cache: Arc<IdentityMap>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Register a merge listener
    pub fn listener(mut self, listener: Arc<dyn MergeListener>) -> Self {
        self.events.add(listener);
        self
    }

    /// Make the session a remote client's mirror of `server`
    ///
    /// Reads go through the server and commits are validated by it. The
    /// server's descriptors are used when none are registered here.
    pub fn server(mut self, server: Session) -> Self {
        self.server = Some(server);
        self
    }

    /// Build the session
    ///
    /// # Errors
    ///
    /// `Config` if the configuration is invalid.
    pub fn build(self) -> CoherenceResult<Session> {
        self.config.validate()?;
        let cascade = self.config.cascade_policy()?;
        let default_sync = self.config.sync_type()?;

        let descriptors = match (&self.server, self.descriptors.is_empty()) {
            (Some(server), true) => (**server.descriptors()).clone(),
            _ => self.descriptors,
        };

        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(IdentityMap::with_default_policy(
                self.config.default_invalidation(),
            ))
        });
        for entity in descriptors.entities() {
            if let Some(policy) = descriptors.get(&entity).and_then(|d| d.invalidation()) {
                cache.set_invalidation_policy(entity, policy);
            }
        }
        let coordinator = Arc::new(WriteLockCoordinator::with_options(
            Arc::clone(&cache),
            self.config.deferred_locks,
            self.config.lock_wait_timeout(),
        ));
        let data_source = self
            .data_source
            .unwrap_or_else(|| Arc::new(EmptyDataSource));

        let id = SessionId::new();
        info!(
            target: "coherence::cache",
            session = %id,
            descriptors = descriptors.len(),
            remote = self.server.is_some(),
            "session started"
        );
        Ok(Session::from_inner(SessionInner {
            id,
            sequencing: Sequencing::new(self.config.sequence_start),
            config: self.config,
            cascade,
            default_sync,
            descriptors: Arc::new(descriptors),
            cache,
            coordinator,
            data_source,
            metrics: MergeMetrics::new(),
            events: self.events,
            server: self.server,
        }))
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
