//! Event Processor Host
//!
//! The entry point: identity (host name, event hub path, consumer group),
//! the chosen stores and broker factory, and the partition manager wiring.
//!
//! ## Lifecycle
//!
//! 1. **Build**: configure via `EventProcessorHost::builder()`
//! 2. **Register**: supply the processor factory; the control loop starts
//! 3. **Run**: pumps come and go with lease ownership
//! 4. **Unregister**: pumps drain, leases are released
//!
//! `register` may be called at most once per host instance, and never after
//! `unregister`; create a fresh host to rejoin the group.
//!
//! ## Example
//!
//! ```rust,no_run
//! use conveyor_host::EventProcessorHost;
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     lease_store: Arc<dyn conveyor_store::LeaseStore>,
//! #     checkpoint_store: Arc<dyn conveyor_store::CheckpointStore>,
//! #     receiver_factory: Arc<dyn conveyor_core::ReceiverFactory>,
//! #     factory: Arc<dyn conveyor_host::EventProcessorFactory>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let host = EventProcessorHost::builder()
//!     .host_name(EventProcessorHost::generated_host_name("worker"))
//!     .event_hub_path("telemetry")
//!     .consumer_group("$default")
//!     .lease_store(lease_store)
//!     .checkpoint_store(checkpoint_store)
//!     .receiver_factory(receiver_factory)
//!     .build()?;
//!
//! host.register(factory).await?;
//! // ... process events ...
//! host.unregister().await;
//! # Ok(())
//! # }
//! ```

use crate::error::{HostError, Result};
use crate::manager::PartitionManager;
use crate::options::HostOptions;
use crate::processor::EventProcessorFactory;
use conveyor_core::ReceiverFactory;
use conveyor_store::{CheckpointStore, LeaseStore};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostState {
    Created,
    Registered,
    Unregistered,
}

/// A cooperating member of an event-hub consumer group.
pub struct EventProcessorHost {
    host_name: String,
    event_hub_path: String,
    consumer_group: String,
    options: HostOptions,
    lease_store: Arc<dyn LeaseStore>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    receiver_factory: Arc<dyn ReceiverFactory>,
    state: RwLock<HostState>,
    manager: RwLock<Option<Arc<PartitionManager>>>,
}

impl EventProcessorHost {
    /// Create a new host builder.
    pub fn builder() -> EventProcessorHostBuilder {
        EventProcessorHostBuilder::new()
    }

    /// A unique host name: `"{prefix}-{uuid}"`.
    ///
    /// Host names must be unique within a consumer group; this is the
    /// conventional way to get one.
    pub fn generated_host_name(prefix: &str) -> String {
        format!("{}-{}", prefix, Uuid::new_v4())
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn event_hub_path(&self) -> &str {
        &self.event_hub_path
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Join the consumer group and start processing.
    ///
    /// Returns once the store is reachable and the initial scan has run, so
    /// a registered host is immediately competing for partitions. Failures
    /// are returned synchronously; after a failure the host may retry.
    pub async fn register(&self, factory: Arc<dyn EventProcessorFactory>) -> Result<()> {
        {
            let state = self.state.read().await;
            match *state {
                HostState::Registered => return Err(HostError::AlreadyRegistered),
                HostState::Unregistered => return Err(HostError::Unregistered),
                HostState::Created => {}
            }
        }

        let manager = Arc::new(PartitionManager::new(
            self.host_name.clone(),
            self.event_hub_path.clone(),
            self.consumer_group.clone(),
            self.options.clone(),
            Arc::clone(&self.lease_store),
            Arc::clone(&self.checkpoint_store),
            Arc::clone(&self.receiver_factory),
            factory,
        ));
        manager.start().await?;

        *self.manager.write().await = Some(Arc::clone(&manager));
        *self.state.write().await = HostState::Registered;

        info!(
            host = %self.host_name,
            event_hub = %self.event_hub_path,
            consumer_group = %self.consumer_group,
            "Host registered"
        );
        Ok(())
    }

    /// Leave the consumer group. Blocks until every pump reached a
    /// terminal state (bounded by `drain_timeout`); idempotent.
    pub async fn unregister(&self) {
        {
            let mut state = self.state.write().await;
            if *state != HostState::Registered {
                *state = HostState::Unregistered;
                return;
            }
            *state = HostState::Unregistered;
        }

        let manager = self.manager.write().await.take();
        if let Some(manager) = manager {
            manager.shutdown().await;
        }

        info!(host = %self.host_name, "Host unregistered");
    }

    /// Partition ids this host currently owns.
    pub async fn owned_partitions(&self) -> Vec<String> {
        match self.manager.read().await.as_ref() {
            Some(manager) => manager.owned_partitions().await,
            None => Vec::new(),
        }
    }
}

/// Builder for `EventProcessorHost`.
pub struct EventProcessorHostBuilder {
    host_name: Option<String>,
    event_hub_path: Option<String>,
    consumer_group: String,
    options: HostOptions,
    lease_store: Option<Arc<dyn LeaseStore>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    receiver_factory: Option<Arc<dyn ReceiverFactory>>,
}

impl EventProcessorHostBuilder {
    pub fn new() -> Self {
        Self {
            host_name: None,
            event_hub_path: None,
            consumer_group: "$default".to_string(),
            options: HostOptions::default(),
            lease_store: None,
            checkpoint_store: None,
            receiver_factory: None,
        }
    }

    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    pub fn event_hub_path(mut self, path: impl Into<String>) -> Self {
        self.event_hub_path = Some(path.into());
        self
    }

    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn options(mut self, options: HostOptions) -> Self {
        self.options = options;
        self
    }

    pub fn lease_store(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.lease_store = Some(store);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn receiver_factory(mut self, factory: Arc<dyn ReceiverFactory>) -> Self {
        self.receiver_factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<EventProcessorHost> {
        self.options.validate()?;

        let event_hub_path = self
            .event_hub_path
            .ok_or_else(|| HostError::InvalidOptions("event_hub_path is required".to_string()))?;
        let lease_store = self
            .lease_store
            .ok_or_else(|| HostError::InvalidOptions("lease_store is required".to_string()))?;
        let checkpoint_store = self
            .checkpoint_store
            .ok_or_else(|| HostError::InvalidOptions("checkpoint_store is required".to_string()))?;
        let receiver_factory = self
            .receiver_factory
            .ok_or_else(|| HostError::InvalidOptions("receiver_factory is required".to_string()))?;

        let host_name = self
            .host_name
            .unwrap_or_else(|| EventProcessorHost::generated_host_name("host"));

        Ok(EventProcessorHost {
            host_name,
            event_hub_path,
            consumer_group: self.consumer_group,
            options: self.options,
            lease_store,
            checkpoint_store,
            receiver_factory,
            state: RwLock::new(HostState::Created),
            manager: RwLock::new(None),
        })
    }
}

impl Default for EventProcessorHostBuilder {
    fn default() -> Self {
        Self::new()
    }
}
