use std::collections::BTreeMap;
use std::sync::Arc;

use skiff_events::{EventKind, EventSink, ResourceRef, SystemEvent};
use tracing::{debug, info, warn};

use crate::compose::labels;
use crate::compose::service::{SUPERVISOR_NETWORK, SUPERVISOR_NETWORK_GATEWAY, SUPERVISOR_NETWORK_SUBNET};
use crate::compose::Network;
use crate::engine::{ContainerEngine, Ipam, IpamPool, NetworkCreate, NetworkInspect};
use crate::error::{ComposeError, Result};

/// Creates and removes application networks, and keeps the agent network.
pub struct NetworkManager {
    engine: Arc<dyn ContainerEngine>,
    events: Arc<dyn EventSink>,
}

impl NetworkManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, events: Arc<dyn EventSink>) -> Self {
        Self { engine, events }
    }

    /// Every managed network on the engine. Unparsable names are skipped.
    pub async fn get_all(&self) -> Result<Vec<Network>> {
        let mut networks = Vec::new();
        for inspect in self.engine.list_networks().await? {
            if !inspect.labels.contains_key(labels::SUPERVISED) {
                continue;
            }
            match Network::from_engine(&inspect) {
                Ok(network) => networks.push(network),
                Err(e) => warn!(name = %inspect.name, error = %e, "Ignoring unmanaged network"),
            }
        }
        Ok(networks)
    }

    /// Creates `network`. An identical existing network is left alone; one
    /// with a different config is an error, since networks are never updated
    /// in place.
    pub async fn create(&self, network: &Network) -> Result<()> {
        let name = network.engine_name();
        match self.engine.inspect_network(&name).await {
            Ok(existing) => {
                let existing = Network::from_engine(&existing)?;
                if existing.is_equal_config(network) {
                    debug!(network = %name, "Network already exists");
                    return Ok(());
                }
                return Err(ComposeError::ResourceRecreationAttempt {
                    kind: "network",
                    name,
                });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        self.emit(EventKind::CreateNetwork, network, None);
        info!(network = %name, "Creating network");
        if let Err(e) = self.engine.create_network(&network.to_create()).await {
            self.emit(EventKind::CreateNetworkError, network, Some(&e));
            return Err(e.into());
        }
        Ok(())
    }

    /// Removes `network`. A network that is already gone is not an error.
    pub async fn remove(&self, network: &Network) -> Result<()> {
        let name = network.engine_name();
        self.emit(EventKind::RemoveNetwork, network, None);
        info!(network = %name, "Removing network");
        match self.engine.remove_network(&name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                self.emit(EventKind::RemoveNetworkError, network, Some(&e));
                Err(e.into())
            }
        }
    }

    /// Whether the agent network exists with the expected addressing.
    pub async fn supervisor_network_ready(&self) -> Result<bool> {
        match self.engine.inspect_network(SUPERVISOR_NETWORK).await {
            Ok(inspect) => Ok(has_supervisor_addressing(&inspect)),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates the agent network, replacing it if its addressing is wrong.
    pub async fn ensure_supervisor_network(&self) -> Result<()> {
        match self.engine.inspect_network(SUPERVISOR_NETWORK).await {
            Ok(inspect) if has_supervisor_addressing(&inspect) => return Ok(()),
            Ok(_) => {
                warn!(network = SUPERVISOR_NETWORK, "Recreating network with wrong addressing");
                self.engine.remove_network(SUPERVISOR_NETWORK).await?;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        info!(network = SUPERVISOR_NETWORK, "Creating supervisor network");
        let spec = NetworkCreate {
            name: SUPERVISOR_NETWORK.to_string(),
            driver: "bridge".to_string(),
            ipam: Ipam {
                driver: "default".to_string(),
                config: vec![IpamPool {
                    subnet: Some(SUPERVISOR_NETWORK_SUBNET.to_string()),
                    gateway: Some(SUPERVISOR_NETWORK_GATEWAY.to_string()),
                    ..IpamPool::default()
                }],
                options: BTreeMap::new(),
            },
            options: BTreeMap::from([(
                "com.docker.network.bridge.name".to_string(),
                SUPERVISOR_NETWORK.to_string(),
            )]),
            ..NetworkCreate::default()
        };
        self.engine.create_network(&spec).await?;
        Ok(())
    }

    fn emit(&self, kind: EventKind, network: &Network, error: Option<&dyn std::fmt::Display>) {
        let mut event = SystemEvent::new(kind).with_resource(ResourceRef::Network {
            app_id: network.app_id,
            name: network.name.clone(),
        });
        if let Some(error) = error {
            event = event.with_error(error);
        }
        self.events.emit(event);
    }
}

fn has_supervisor_addressing(inspect: &NetworkInspect) -> bool {
    inspect.ipam.config.first().is_some_and(|pool| {
        pool.subnet.as_deref() == Some(SUPERVISOR_NETWORK_SUBNET)
            && pool.gateway.as_deref() == Some(SUPERVISOR_NETWORK_GATEWAY)
    })
}
