//! Process-wide state shared by every request handler.
//!
//! Everything lives behind `Arc`s in one [`SharedSystemState`]; handlers get
//! a cheap clone of [`AppState`].

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::agent::AgentLoop;
use crate::auth::{PasswordHasher, TokenService};
use crate::chat_db::ChatDatabase;
use crate::config::Config;
use crate::conversion::{CliRenderer, DocumentRenderer};
use crate::llm::{ChatModel, LLMWorker};
use crate::metrics;
use crate::thread_pool::ConversionPool;
use crate::tools::{CurrentTimeTool, ReasoningTool, SearchClient, ToolRegistry, WebSearchTool};

/// Atomic counters reported by the admin endpoint.
#[derive(Debug, Default)]
pub struct AtomicCounters {
    pub total_requests: AtomicUsize,
    pub chat_streams: AtomicUsize,
    pub uploaded_files: AtomicUsize,
}

impl AtomicCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_total_requests(&self) -> usize {
        self.total_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_chat_streams(&self) -> usize {
        self.chat_streams.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_uploaded_files(&self) -> usize {
        self.uploaded_files.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub struct SharedSystemState {
    /// Read-only after startup.
    pub config: Arc<Config>,
    pub database: Arc<ChatDatabase>,
    pub tokens: Arc<TokenService>,
    pub passwords: Arc<PasswordHasher>,
    pub tools: Arc<ToolRegistry>,
    pub llm_worker: Arc<dyn ChatModel>,
    pub conversion: Arc<ConversionPool>,
    /// Sessions with a chat stream in flight.
    pub active_streams: Arc<DashMap<i64, Instant>>,
    pub counters: Arc<AtomicCounters>,
    pub started_at: Instant,
}

impl SharedSystemState {
    pub fn new(config: Config, database: Arc<ChatDatabase>) -> anyhow::Result<Self> {
        let llm_worker: Arc<dyn ChatModel> = Arc::new(LLMWorker::new(&config.llm));
        let renderer: Arc<dyn DocumentRenderer> = Arc::new(CliRenderer::new(&config.conversion));
        Self::with_components(config, database, llm_worker, renderer)
    }

    /// Builds the state around an explicit model and renderer.
    pub fn with_components(
        config: Config,
        database: Arc<ChatDatabase>,
        llm_worker: Arc<dyn ChatModel>,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> anyhow::Result<Self> {
        info!("Initializing shared system state");

        let tools = Arc::new(build_tools(&config)?);
        info!("Registered tools: {}", tools.names().join(", "));

        let conversion = Arc::new(ConversionPool::start(
            config.conversion.workers,
            config.conversion.queue_size,
            database.clone(),
            renderer,
        )?);

        Ok(Self {
            tokens: Arc::new(TokenService::new(&config.auth)),
            passwords: Arc::new(PasswordHasher::new()?),
            config: Arc::new(config),
            database,
            tools,
            llm_worker,
            conversion,
            active_streams: Arc::new(DashMap::new()),
            counters: Arc::new(AtomicCounters::new()),
            started_at: Instant::now(),
        })
    }

    pub fn agent_loop(&self) -> AgentLoop {
        AgentLoop::new(
            self.database.clone(),
            self.llm_worker.clone(),
            self.tools.clone(),
            self.config.agent.clone(),
        )
    }

    /// Claims the session for one stream. `None` if a stream is already
    /// running for it.
    pub fn try_begin_stream(&self, session_id: i64) -> Option<StreamGuard> {
        match self.active_streams.entry(session_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                metrics::inc_streams();
                self.counters.inc_chat_streams();
                Some(StreamGuard {
                    streams: self.active_streams.clone(),
                    session_id,
                })
            }
        }
    }
}

fn build_tools(config: &Config) -> anyhow::Result<ToolRegistry> {
    let search_client = Arc::new(SearchClient::new(&config.search)?);
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(WebSearchTool::new(search_client, config.search.clone())));
    registry.register(Arc::new(CurrentTimeTool::new(config.agent.default_timezone.clone())));
    registry.register(Arc::new(ReasoningTool));
    Ok(registry)
}

/// Releases the session's stream slot on drop.
pub struct StreamGuard {
    streams: Arc<DashMap<i64, Instant>>,
    session_id: i64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some((_, started)) = self.streams.remove(&self.session_id) {
            debug!(
                session_id = self.session_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Chat stream released"
            );
        }
        metrics::dec_streams();
    }
}

/// Router state. Derefs to [`SharedSystemState`].
#[derive(Clone)]
pub struct AppState {
    pub shared_state: Arc<SharedSystemState>,
}

impl AppState {
    pub fn new(shared_state: Arc<SharedSystemState>) -> Self {
        Self { shared_state }
    }
}

impl Deref for AppState {
    type Target = SharedSystemState;

    fn deref(&self) -> &Self::Target {
        &self.shared_state
    }
}
