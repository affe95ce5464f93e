use tokio::sync::RwLock;

use crate::config::ChainConfig;
use crate::db::{CapabilityFlags, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMethod {
    /// `debug_traceBlockByNumber` with the `callTracer`.
    DebugCallTracer,
    /// Parity/OpenEthereum style `trace_block`.
    TraceBlock,
}

impl TraceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceMethod::DebugCallTracer => "debug_traceBlockByNumber",
            TraceMethod::TraceBlock => "trace_block",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug_traceBlockByNumber" => Some(TraceMethod::DebugCallTracer),
            "trace_block" => Some(TraceMethod::TraceBlock),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceSupport {
    /// Not detected yet, or the last detection attempt hit a transport failure.
    #[default]
    Unknown,
    Supported(TraceMethod),
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Capabilities {
    trace: TraceSupport,
    block_receipts: Option<bool>,
}

/// Static chain configuration plus the capability flags discovered while
/// indexing. Shared by the adapter and the scheduler of one chain.
pub struct ChainRuntime {
    pub config: ChainConfig,
    capabilities: RwLock<Capabilities>,
}

impl ChainRuntime {
    pub fn new(config: ChainConfig) -> Self {
        Self {
            config,
            capabilities: RwLock::new(Capabilities::default()),
        }
    }

    /// Restore previously discovered flags.
    pub fn with_flags(config: ChainConfig, flags: &CapabilityFlags) -> Self {
        let trace = match (flags.trace_supported, flags.trace_method.as_deref()) {
            (Some(true), Some(method)) => TraceMethod::parse(method)
                .map(TraceSupport::Supported)
                .unwrap_or_default(),
            (Some(false), _) => TraceSupport::Unsupported,
            _ => TraceSupport::Unknown,
        };

        Self {
            config,
            capabilities: RwLock::new(Capabilities {
                trace,
                block_receipts: flags.block_receipts_supported,
            }),
        }
    }

    pub async fn load(config: ChainConfig, store: &dyn Store) -> eyre::Result<Self> {
        let flags = store.load_capabilities(config.chain_id as i64).await?;
        Ok(Self::with_flags(config, &flags))
    }

    pub fn chain_id(&self) -> i64 {
        self.config.chain_id as i64
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn trace_support(&self) -> TraceSupport {
        self.capabilities.read().await.trace
    }

    pub async fn block_receipts(&self) -> Option<bool> {
        self.capabilities.read().await.block_receipts
    }

    /// Update trace support; mirrors the change to the store when it differs.
    pub async fn set_trace_support(
        &self,
        support: TraceSupport,
        store: &dyn Store,
    ) -> eyre::Result<()> {
        {
            let mut caps = self.capabilities.write().await;
            if caps.trace == support {
                return Ok(());
            }
            caps.trace = support;
        }
        tracing::info!(chain = %self.name(), ?support, "Trace capability updated");
        self.persist(store).await
    }

    pub async fn set_block_receipts(&self, supported: bool, store: &dyn Store) -> eyre::Result<()> {
        {
            let mut caps = self.capabilities.write().await;
            if caps.block_receipts == Some(supported) {
                return Ok(());
            }
            caps.block_receipts = Some(supported);
        }
        tracing::info!(chain = %self.name(), supported, "eth_getBlockReceipts capability updated");
        self.persist(store).await
    }

    pub async fn flags(&self) -> CapabilityFlags {
        let caps = *self.capabilities.read().await;
        let (trace_supported, trace_method) = match caps.trace {
            TraceSupport::Unknown => (None, None),
            TraceSupport::Supported(method) => (Some(true), Some(method.as_str().to_string())),
            TraceSupport::Unsupported => (Some(false), None),
        };
        CapabilityFlags {
            trace_supported,
            trace_method,
            block_receipts_supported: caps.block_receipts,
        }
    }

    async fn persist(&self, store: &dyn Store) -> eyre::Result<()> {
        let flags = self.flags().await;
        store.save_capabilities(self.chain_id(), &flags).await
    }
}
