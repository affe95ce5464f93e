use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::ChainAdapter;
use crate::chain::ChainRuntime;
use crate::config::{ChainConfig, SchedulerConfig};
use crate::db::{CursorStatus, Store};
use crate::decoders::DecoderRegistry;
use crate::indexer::scheduler::ChainScheduler;
use crate::rpc::Transport;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("chain {0} is not configured")]
    UnknownChain(i64),

    #[error("chain {0} is already running")]
    AlreadyRunning(i64),

    #[error("chain {0} is still starting")]
    Starting(i64),

    #[error("chain {0} is not running")]
    NotRunning(i64),

    #[error(transparent)]
    Internal(#[from] eyre::Report),
}

/// Where ingestion begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Resume the stored cursor. Without one, begin at `start_block` from
    /// the chain config, else at the current head.
    Configured,
    /// Reposition to this block, replacing any stored cursor.
    Block(u64),
    /// Reposition to the current head, replacing any stored cursor.
    Latest,
}

struct RunningChain {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum Slot {
    /// Reserved while `start` loads the chain and positions its cursor.
    Starting,
    Running(RunningChain),
}

impl Slot {
    fn is_active(&self) -> bool {
        match self {
            Slot::Starting => true,
            Slot::Running(r) => !r.handle.is_finished(),
        }
    }
}

type Slots = Mutex<HashMap<i64, Slot>>;

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<i64, Slot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Frees a `Starting` slot if `start` fails or is dropped midway.
struct Reservation<'a> {
    slots: &'a Slots,
    chain_id: i64,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut slots = lock(self.slots);
        if matches!(slots.get(&self.chain_id), Some(Slot::Starting)) {
            slots.remove(&self.chain_id);
        }
    }
}

/// Starts and stops per-chain schedulers. At most one scheduler runs per
/// chain. The slot map is never locked across I/O.
pub struct Controller {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    registry: Arc<DecoderRegistry>,
    settings: SchedulerConfig,
    chains: HashMap<i64, ChainConfig>,
    slots: Slots,
    shutdown: CancellationToken,
}

impl Controller {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        registry: Arc<DecoderRegistry>,
        settings: SchedulerConfig,
        chains: Vec<ChainConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            transport,
            registry,
            settings,
            chains: chains
                .into_iter()
                .map(|c| (c.chain_id as i64, c))
                .collect(),
            slots: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn is_configured(&self, chain_id: i64) -> bool {
        self.chains.contains_key(&chain_id)
    }

    pub async fn is_running(&self, chain_id: i64) -> bool {
        lock(&self.slots)
            .get(&chain_id)
            .is_some_and(|slot| matches!(slot, Slot::Running(r) if !r.handle.is_finished()))
    }

    /// Start ingestion for a chain. `Configured` resumes a stored cursor;
    /// an explicit block or `Latest` repositions it.
    pub async fn start(&self, chain_id: i64, from: StartFrom) -> Result<(), ControlError> {
        let config = self
            .chains
            .get(&chain_id)
            .cloned()
            .ok_or(ControlError::UnknownChain(chain_id))?;

        let reservation = {
            let mut slots = lock(&self.slots);
            if slots.get(&chain_id).is_some_and(Slot::is_active) {
                return Err(ControlError::AlreadyRunning(chain_id));
            }
            slots.insert(chain_id, Slot::Starting);
            Reservation {
                slots: &self.slots,
                chain_id,
            }
        };

        let running = self.launch(chain_id, config, from).await?;
        lock(&self.slots).insert(chain_id, Slot::Running(running));
        drop(reservation);
        Ok(())
    }

    async fn launch(
        &self,
        chain_id: i64,
        config: ChainConfig,
        from: StartFrom,
    ) -> eyre::Result<RunningChain> {
        let chain = Arc::new(ChainRuntime::load(config, self.store.as_ref()).await?);
        let adapter = ChainAdapter::build(&chain, self.transport.clone(), self.registry.clone());

        let existing = self.store.get_cursor(chain_id).await?;
        let first_block = match (from, &existing, chain.config.start_block) {
            (StartFrom::Configured, Some(_), _) => None,
            (StartFrom::Block(n), ..) | (StartFrom::Configured, None, Some(n)) => Some(n),
            _ => Some(adapter.latest_height(&chain).await?),
        };

        if let Some(first_block) = first_block {
            let last_indexed = first_block as i64 - 1;
            match existing {
                Some(cursor) => {
                    tracing::info!(
                        chain = %chain.name(),
                        from = cursor.last_indexed_block,
                        to = last_indexed,
                        "Repositioning cursor"
                    );
                    self.store.reset_cursor(chain_id, last_indexed).await?;
                }
                None => self.store.init_cursor(chain_id, last_indexed).await?,
            }
        }

        self.store
            .set_status(chain_id, CursorStatus::Running, None, None)
            .await?;

        let cancel = self.shutdown.child_token();
        let scheduler = ChainScheduler::new(
            chain.clone(),
            adapter,
            self.store.clone(),
            self.settings.clone(),
            cancel.clone(),
        );
        let store = self.store.clone();
        let name = chain.name().to_string();

        let handle = tokio::spawn(async move {
            let outcome = scheduler.run().await;
            let update = match &outcome {
                Ok(()) => store.set_status(chain_id, CursorStatus::Stopped, None, None).await,
                Err(e) => {
                    let message = format!("{:#}", e);
                    tracing::error!(chain = %name, error = %message, "Chain ingestion failed");
                    store
                        .set_status(chain_id, CursorStatus::Error, None, Some(&message))
                        .await
                }
            };
            if let Err(e) = update {
                tracing::error!(chain = %name, error = %e, "Failed to record chain status");
            }
        });

        tracing::info!(chain = %chain.name(), chain_id, "Chain started");
        Ok(RunningChain { cancel, handle })
    }

    /// Cancel a chain's scheduler and wait for it to finish its current unit.
    pub async fn stop(&self, chain_id: i64) -> Result<(), ControlError> {
        if !self.is_configured(chain_id) {
            return Err(ControlError::UnknownChain(chain_id));
        }
        let entry = {
            let mut slots = lock(&self.slots);
            match slots.remove(&chain_id) {
                Some(Slot::Running(entry)) => entry,
                Some(Slot::Starting) => {
                    slots.insert(chain_id, Slot::Starting);
                    return Err(ControlError::Starting(chain_id));
                }
                None => return Err(ControlError::NotRunning(chain_id)),
            }
        };

        entry.cancel.cancel();
        if let Err(e) = entry.handle.await {
            tracing::error!(chain_id, error = %e, "Scheduler task panicked");
        }

        self.store
            .set_status(chain_id, CursorStatus::Stopped, None, None)
            .await?;
        tracing::info!(chain_id, "Chain stopped");
        Ok(())
    }

    pub async fn stop_all(&self) {
        let ids: Vec<i64> = lock(&self.slots)
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
            .map(|(id, _)| *id)
            .collect();
        for chain_id in ids {
            if let Err(e) = self.stop(chain_id).await {
                tracing::warn!(chain_id, error = %e, "Failed to stop chain");
            }
        }
    }
}
