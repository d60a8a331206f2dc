//! The event loop that owns a [`Store`].
//!
//! One task drains queued action envelopes in batches, runs the effects they
//! request, publishes the resulting snapshot on a watch channel, exchanges
//! sync messages with sibling stores and writes the persisted blob on an
//! interval. Everything else talks to it through a [`RuntimeHandle`].

pub mod executor;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::core::actions::{Action, ActionDispatcher, ActionEnvelope};
use crate::core::constants::DEFAULT_PERSIST_INTERVAL_MS;
use crate::core::ids::TabId;
use crate::core::persist::{self, PersistError, Storage};
use crate::core::snapshot::Snapshot;
use crate::core::store::{DispatchError, Store};
use crate::core::sync::{SyncError, SyncMessage, SyncPort};

pub use executor::EffectExecutor;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to restore persisted state: {0}")]
    Persist(#[from] PersistError),
    #[error("failed to apply persisted state: {0}")]
    Hydrate(#[from] DispatchError),
}

/// Cheap to clone. Gives access to the latest published snapshot and the
/// action queue of a running [`Runtime`].
#[derive(Clone)]
pub struct RuntimeHandle {
    dispatcher: ActionDispatcher,
    snapshots: watch::Receiver<Arc<Snapshot>>,
    shutdown: CancellationToken,
}

impl RuntimeHandle {
    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    pub fn dispatch(&self, tab_id: &TabId, action: Action) {
        self.dispatcher.dispatch(tab_id, action);
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    /// A receiver that wakes once per published batch.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshots.clone()
    }

    /// Waits until a published snapshot satisfies `condition`. Returns `None`
    /// if the runtime stopped first.
    pub async fn wait_for(
        &self,
        mut condition: impl FnMut(&Snapshot) -> bool,
    ) -> Option<Arc<Snapshot>> {
        let mut receiver = self.snapshots.clone();
        let snapshot = receiver.wait_for(|snapshot| condition(snapshot.as_ref())).await.ok()?;
        Some(Arc::clone(&snapshot))
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

pub struct Runtime {
    store: Store,
    storage: Arc<dyn Storage>,
    sync: Option<SyncPort>,
    executor: EffectExecutor,
    dispatcher: ActionDispatcher,
    action_rx: mpsc::UnboundedReceiver<ActionEnvelope>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    shutdown: CancellationToken,
    persist_interval: Duration,
    last_persisted: Arc<Snapshot>,
}

impl Runtime {
    pub fn new(store: Store, api: Arc<dyn ApiClient>, storage: Arc<dyn Storage>) -> Self {
        let (tx, action_rx) = mpsc::unbounded_channel();
        let dispatcher = ActionDispatcher::new(tx);
        let snapshot = store.snapshot();
        let (snapshot_tx, _) = watch::channel(Arc::clone(&snapshot));
        Self {
            executor: EffectExecutor::new(api, dispatcher.clone()),
            store,
            storage,
            sync: None,
            dispatcher,
            action_rx,
            snapshot_tx,
            shutdown: CancellationToken::new(),
            persist_interval: Duration::from_millis(DEFAULT_PERSIST_INTERVAL_MS),
            last_persisted: snapshot,
        }
    }

    /// Connects the runtime to sibling stores.
    pub fn with_sync(mut self, port: SyncPort) -> Self {
        self.sync = Some(port);
        self
    }

    pub fn with_persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            dispatcher: self.dispatcher.clone(),
            snapshots: self.snapshot_tx.subscribe(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Restores the persisted blob, if any, into the store.
    ///
    /// A corrupted blob is an error; an unreadable schema is skipped by
    /// [`persist::hydrate`] and the store starts empty.
    pub fn bootstrap(&mut self) -> Result<(), RuntimeError> {
        let Some(state) = persist::hydrate(self.storage.as_ref())? else {
            return Ok(());
        };
        let records = state.cache.record_count();
        self.store.dispatch(
            &TabId::system(),
            Action::Hydrate {
                state: Box::new(state),
            },
        )?;
        info!(records, "restored persisted state");
        self.last_persisted = self.store.snapshot();
        self.publish();
        Ok(())
    }

    /// Runs until [`RuntimeHandle::shutdown`] is called, then writes the
    /// blob one last time and cancels in-flight requests.
    pub async fn run(mut self) {
        let mut persist_tick = tokio::time::interval(self.persist_interval);
        persist_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(envelope) = self.action_rx.recv() => {
                    let mut batch = vec![envelope];
                    while let Ok(envelope) = self.action_rx.try_recv() {
                        batch.push(envelope);
                    }
                    self.process_batch(batch);
                }
                message = recv_sync(&mut self.sync) => match message {
                    Ok(message) => self.receive(message),
                    Err(SyncError::Lagged(skipped)) => self.recover_from_lag(skipped),
                    Err(err) => {
                        warn!(error = %err, "sync channel unavailable; continuing without it");
                        self.sync = None;
                    }
                },
                _ = persist_tick.tick() => self.persist_if_changed(),
            }
        }

        self.persist_if_changed();
        self.executor.cancel_all();
        debug!("runtime stopped");
    }

    fn process_batch(&mut self, batch: Vec<ActionEnvelope>) {
        let size = batch.len();
        let kinds: Vec<&'static str> = batch.iter().map(|envelope| envelope.action.name()).collect();
        let results = self.store.apply_batch(batch);
        for (kind, result) in kinds.into_iter().zip(results) {
            if let Err(err) = result {
                warn!(action = kind, error = %err, "action not applied");
            }
        }
        debug!(size, version = self.store.version(), "batch applied");
        self.after_batch();
    }

    fn receive(&mut self, message: SyncMessage) {
        if let Some(Err(err)) = self.store.receive(message) {
            warn!(error = %err, "remote change not applied");
        }
        self.store.flush();
        self.after_batch();
    }

    /// Remote changes were dropped by the channel; reload the chat list
    /// through the first live tab so this store catches up with the server.
    fn recover_from_lag(&mut self, skipped: u64) {
        let snapshot = self.store.snapshot();
        let Some(tab_id) = snapshot.by_tab.keys().find(|tab| !tab.is_system()).cloned() else {
            warn!(skipped, "sync receiver lagged and no tab is open to reload through");
            return;
        };
        warn!(skipped, tab = %tab_id, "sync receiver lagged; reloading chats");
        if let Err(err) = self.store.dispatch(&tab_id, Action::LoadChats) {
            warn!(error = %err, "could not schedule a reload after lag");
        }
        self.store.flush();
        self.after_batch();
    }

    fn after_batch(&mut self) {
        self.executor.prune();
        for request in self.store.take_effects() {
            self.executor.execute(request);
        }
        let outbox = self.store.take_outbox();
        if let Some(port) = &self.sync {
            for message in &outbox {
                if let Err(err) = port.publish(message) {
                    debug!(error = %err, "no sibling stores listening");
                    break;
                }
            }
        }
        self.publish();
    }

    fn publish(&self) {
        let snapshot = self.store.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if Arc::ptr_eq(current, &snapshot) {
                return false;
            }
            *current = Arc::clone(&snapshot);
            true
        });
    }

    fn persist_if_changed(&mut self) {
        let current = self.store.snapshot();
        if !persist::persistable_changed(&self.last_persisted, &current) {
            return;
        }
        match persist::persist(self.storage.as_ref(), &current, Utc::now()) {
            Ok(()) => self.last_persisted = current,
            Err(err) => warn!(error = %err, "failed to persist state"),
        }
    }
}

async fn recv_sync(port: &mut Option<SyncPort>) -> Result<SyncMessage, SyncError> {
    match port {
        Some(port) => port.recv().await,
        None => std::future::pending().await,
    }
}
