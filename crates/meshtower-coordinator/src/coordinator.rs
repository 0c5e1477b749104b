//! Multi-zone coordinator and the per-zone consumer loop

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use meshtower_ipam::Ipam;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{validate_zone_name, CoordinatorConfig, HealthcheckConfig, ZoneConfig};
use crate::error::{CoordinatorError, NotFoundError, Result, TransportError};
use crate::protocol::{self, Inbound};
use crate::transport::{PubSub, Subscription};
use crate::zone::{ZoneHandle, ZoneState};

/// First wait before subscribing again to a channel whose stream ended
const RESUBSCRIBE_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Cap on the resubscribe backoff
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(5);

/// Subscribe to `channel` again after its stream ended
///
/// Each attempt waits first, doubling the wait up to [`RESUBSCRIBE_MAX_DELAY`].
/// Returns `None` once shutdown is signalled.
async fn resubscribe(
    bus: &dyn PubSub,
    channel: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Subscription> {
    let mut delay = RESUBSCRIBE_INITIAL_DELAY;
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            () = tokio::time::sleep(delay) => {}
        }
        if *shutdown.borrow() {
            return None;
        }

        attempt += 1;
        match bus.subscribe(channel).await {
            Ok(subscription) => {
                info!(channel, attempt, "Resubscribed");
                return Some(subscription);
            }
            Err(e) => {
                warn!(channel, attempt, error = %e, "Resubscribe failed");
                delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
            }
        }
    }
}

/// Sequential consumer of one zone channel
struct ZoneLoop {
    zone: ZoneHandle,
    bus: Arc<dyn PubSub>,
    subscription: Subscription,
    shutdown: watch::Receiver<bool>,
}

impl ZoneLoop {
    async fn run(mut self) {
        info!(zone = %self.zone.name(), "Zone loop started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                message = self.subscription.recv() => match message {
                    Some(payload) => handle_message(&self.zone, &payload).await,
                    None => {
                        warn!(zone = %self.zone.name(), "Zone subscription closed");
                        self.subscription.close();
                        let resubscribed =
                            resubscribe(self.bus.as_ref(), self.zone.name(), &mut self.shutdown).await;
                        match resubscribed {
                            Some(subscription) => self.subscription = subscription,
                            None => break,
                        }
                    }
                },
            }
        }

        self.subscription.close();
        if let Err(e) = self.zone.persist().await {
            warn!(zone = %self.zone.name(), error = %e, "Failed to flush allocator state");
        }
        info!(zone = %self.zone.name(), "Zone loop stopped");
    }
}

/// Apply one zone message; failures are logged and the message dropped
async fn handle_message(zone: &ZoneHandle, payload: &[u8]) {
    match protocol::decode(payload) {
        Ok(Inbound::Register(peer)) => {
            let key = peer.public_key.clone();
            if let Err(e) = zone.register(peer).await {
                warn!(zone = %zone.name(), public_key = %key, error = %e, "Dropped registration");
            }
        }
        Ok(Inbound::PeerList(peers)) => {
            trace!(zone = %zone.name(), peers = peers.len(), "Ignoring peer list");
        }
        Err(e) => {
            warn!(zone = %zone.name(), error = %e, "Dropped message");
        }
    }
}

/// Answers readiness probes from agents
async fn run_healthcheck(
    bus: Arc<dyn PubSub>,
    config: HealthcheckConfig,
    mut subscription: Subscription,
    mut shutdown: watch::Receiver<bool>,
) {
    let reply = Bytes::from(config.reply_message.clone());

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            message = subscription.recv() => match message {
                Some(payload) if payload == config.ready_request.as_bytes() => {
                    match bus.publish(&config.reply_channel, reply.clone()).await {
                        Ok(_) => debug!("Answered readiness request"),
                        Err(e) => warn!(error = %e, "Failed to answer readiness request"),
                    }
                }
                Some(_) => trace!("Ignoring healthcheck message"),
                None => {
                    warn!(channel = %config.request_channel, "Healthcheck subscription closed");
                    subscription.close();
                    match resubscribe(bus.as_ref(), &config.request_channel, &mut shutdown).await {
                        Some(resubscribed) => subscription = resubscribed,
                        None => break,
                    }
                }
            },
        }
    }

    subscription.close();
}

/// Owns every zone, its loop task, and the shared bus
pub struct Coordinator {
    config: CoordinatorConfig,
    bus: Arc<dyn PubSub>,
    zones: DashMap<String, ZoneHandle>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    /// Serializes zone creation
    zone_creation: Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("zones", &self.zone_names())
            .field("default_zone", &self.config.default_zone)
            .finish()
    }
}

impl Coordinator {
    /// Restore and start every configured zone
    ///
    /// A corrupt allocator state file aborts startup.
    pub async fn start(config: CoordinatorConfig, bus: Arc<dyn PubSub>) -> Result<Arc<Self>> {
        if !config.zones.is_empty() && !config.zones.iter().any(|z| z.name == config.default_zone) {
            return Err(CoordinatorError::config(format!(
                "default zone '{}' is not among the configured zones",
                config.default_zone
            )));
        }

        let (shutdown, _) = watch::channel(false);
        let coordinator = Arc::new(Self {
            config,
            bus,
            zones: DashMap::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            zone_creation: Mutex::new(()),
            shutdown,
        });

        for zone in coordinator.config.zones.clone() {
            coordinator.add_zone(zone).await?;
        }

        if coordinator.config.healthcheck.enabled {
            coordinator.start_healthcheck().await?;
        }

        info!(zones = coordinator.zones.len(), "Coordinator started");
        Ok(coordinator)
    }

    async fn start_healthcheck(&self) -> Result<()> {
        let config = self.config.healthcheck.clone();
        let subscription = self.bus.subscribe(&config.request_channel).await?;
        debug!(channel = %config.request_channel, "Healthcheck responder subscribed");

        let task = tokio::spawn(run_healthcheck(
            self.bus.clone(),
            config,
            subscription,
            self.shutdown.subscribe(),
        ));
        self.tasks.lock().push(task);
        Ok(())
    }

    /// Create a zone, restore its allocator, and start its loop
    ///
    /// The name becomes both a bus channel and a state file name, so it is
    /// checked before anything is read from disk.
    pub async fn add_zone(&self, config: ZoneConfig) -> Result<ZoneHandle> {
        validate_zone_name(&config.name)?;
        if self.config.healthcheck.uses_channel(&config.name) {
            return Err(CoordinatorError::config(format!(
                "zone name '{}' is reserved for health checks",
                config.name
            )));
        }

        let _creating = self.zone_creation.lock().await;

        if *self.shutdown.borrow() {
            return Err(TransportError::Closed("coordinator is shutting down".to_string()).into());
        }
        if self.zones.contains_key(&config.name) {
            return Err(CoordinatorError::ZoneExists(config.name));
        }

        let state_path = self.config.state_path(&config.name);
        let ipam = match &state_path {
            Some(path) => Ipam::restore(path).await?,
            None => Ipam::new(),
        };
        let state = ZoneState::new(&config, ipam, state_path)?;
        let name = state.name().to_string();
        let cidr = state.info().cidr;

        let subscription = self.bus.subscribe(&name).await?;
        let handle = ZoneHandle::new(state, self.bus.clone());
        if let Err(e) = handle.persist().await {
            warn!(zone = %name, error = %e, "Failed to persist allocator state");
        }

        let zone_loop = ZoneLoop {
            zone: handle.clone(),
            bus: self.bus.clone(),
            subscription,
            shutdown: self.shutdown.subscribe(),
        };
        self.tasks.lock().push(tokio::spawn(zone_loop.run()));
        self.zones.insert(name.clone(), handle.clone());

        info!(zone = %name, cidr = %cidr, "Zone started");
        Ok(handle)
    }

    pub fn zone(&self, name: &str) -> Result<ZoneHandle> {
        self.zones
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| NotFoundError::zone(name).into())
    }

    /// The zone behind the un-prefixed peer routes
    pub fn default_zone(&self) -> Result<ZoneHandle> {
        self.zone(&self.config.default_zone)
    }

    /// Every running zone, ordered by name
    pub fn zones(&self) -> Vec<ZoneHandle> {
        let mut zones: Vec<ZoneHandle> = self.zones.iter().map(|e| e.value().clone()).collect();
        zones.sort_by(|a, b| a.name().cmp(b.name()));
        zones
    }

    pub fn zone_names(&self) -> Vec<String> {
        self.zones().iter().map(|z| z.name().to_string()).collect()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn bus(&self) -> Arc<dyn PubSub> {
        self.bus.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop every loop after its current message and wait for the flushes
    pub async fn shutdown(&self) {
        let _creating = self.zone_creation.lock().await;
        self.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        info!(tasks = tasks.len(), "Stopping coordinator");

        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Coordinator task failed");
            }
        }
        info!("Coordinator stopped");
    }
}
