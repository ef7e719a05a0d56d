//! Gateway supervisor: spawns one task per enabled connector, owns the
//! shared state registry and the route-table status feed, and tears
//! everything down in order on shutdown.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::connector::{Connector, StateRegistry};
use crate::kv::KvStore;
use crate::queue::QueueTransport;
use crate::routing::RouteTable;

pub struct Supervisor {
    config: Arc<GatewayConfig>,
    queues: Arc<dyn QueueTransport>,
    kv: Arc<dyn KvStore>,
    states: StateRegistry,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(
        config: Arc<GatewayConfig>,
        queues: Arc<dyn QueueTransport>,
        kv: Arc<dyn KvStore>,
    ) -> Supervisor {
        Supervisor {
            config,
            queues,
            kv,
            states: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// The shared connector-state registry (read by the HTTP status surface).
    pub fn states(&self) -> StateRegistry {
        Arc::clone(&self.states)
    }

    /// Spawn every enabled connector's lifecycle task.
    pub fn start(&mut self) {
        for (name, connector_config) in &self.config.connectors {
            if connector_config.disabled {
                info!(connector = %name, "skipping disabled connector");
                continue;
            }

            let connector = Connector::new(
                name,
                connector_config.clone(),
                Arc::clone(&self.queues),
                Arc::clone(&self.kv),
                Arc::clone(&self.states),
                self.config.connector_queue(name),
                self.config.dlr_queue(),
                self.config.mo_queue(),
            );

            info!(connector = %name, "starting connector");
            let shutdown = self.shutdown.child_token();
            self.tasks
                .push(tokio::spawn(async move { connector.run(shutdown).await }));
        }
    }

    /// Periodically push the live state registry into the route table.
    /// Eventually consistent on purpose; smartrr tolerates stale state.
    pub fn start_status_feed(&mut self, route_table: Arc<RouteTable>) {
        let states = Arc::clone(&self.states);
        let interval = Duration::from_secs(self.config.status_refresh_interval.max(1));
        let shutdown = self.shutdown.child_token();

        self.tasks.push(tokio::spawn(async move {
            loop {
                push_states(&states, &route_table);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }));
    }

    /// Push the registry into the route table once, immediately.
    pub fn refresh_route_table(&self, route_table: &RouteTable) {
        push_states(&self.states, route_table);
    }

    /// Cancel every connector task and wait for them to finish. Shared
    /// resources (store, transport) are dropped by their owners afterwards.
    pub async fn shutdown(mut self) {
        info!("supervisor shutting down");
        self.shutdown.cancel();

        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "connector task ended abnormally");
                }
            }
        }
        info!("all connector tasks stopped");
    }
}

fn push_states(states: &StateRegistry, route_table: &RouteTable) {
    let snapshot: HashMap<String, String> = states
        .read()
        .expect("state registry lock")
        .iter()
        .map(|(name, state)| (name.clone(), state.as_str().to_string()))
        .collect();
    route_table.update_connector_status(snapshot);
}
