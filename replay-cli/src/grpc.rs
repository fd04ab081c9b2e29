//! gRPC dispatch for the replay buffer service.
//!
//! Owns the table registry (fixed after construction), the unary operations,
//! and the glue spawning one handler task per bidirectional stream.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::info;

use replay_core::{ChunkStore, Table, TaskExecutor};
use replay_proto::replay_buffer_server::{ReplayBuffer, ReplayBufferServer};
use replay_proto::{
    CheckpointRequest, CheckpointResponse, InitializeConnectionRequest,
    InitializeConnectionResponse, InsertStreamRequest, InsertStreamResponse,
    MutatePrioritiesRequest, MutatePrioritiesResponse, ResetRequest, ResetResponse,
    SampleStreamRequest, SampleStreamResponse, ServerInfoRequest, ServerInfoResponse, Uint128,
};
use replay_storage::Checkpointer;

use crate::streams::{self, table_not_found, table_status};

/// State shared by every request handler and stream task.
pub(crate) struct ServiceState {
    tables: HashMap<String, Arc<Table>>,
    chunk_store: Arc<ChunkStore>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    tables_state_id: Uint128,
    // Keeps the callback pool alive as long as the service runs.
    _callback_executor: Arc<TaskExecutor>,
}

impl ServiceState {
    pub(crate) fn table_by_name(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.get(name).cloned()
    }

    pub(crate) fn chunk_store(&self) -> &ChunkStore {
        &self.chunk_store
    }
}

/// The replay buffer gRPC service.
pub struct ReplayService {
    state: Arc<ServiceState>,
}

impl ReplayService {
    /// Build the service from a table list and an optional checkpointer.
    ///
    /// When a checkpointer is present the newest checkpoint is restored; a
    /// missing checkpoint falls through to the configured fallback, and a
    /// missing fallback starts the service empty. Any other load failure is
    /// fatal. Duplicate table names are rejected.
    pub fn new(
        tables: Vec<Arc<Table>>,
        checkpointer: Option<Arc<dyn Checkpointer>>,
        callback_executor_threads: usize,
    ) -> anyhow::Result<Self> {
        let chunk_store = Arc::new(ChunkStore::new());

        if let Some(checkpointer) = &checkpointer {
            match checkpointer.load_latest(&chunk_store, &tables) {
                Ok(()) => info!(
                    checkpointer = %checkpointer.debug_string(),
                    "restored latest checkpoint"
                ),
                Err(error) if error.is_not_found() => {
                    match checkpointer.load_fallback(&chunk_store, &tables) {
                        Ok(()) => info!("restored fallback checkpoint"),
                        Err(error) if error.is_not_found() => {
                            info!("no checkpoint found; starting empty");
                        }
                        Err(error) => {
                            return Err(error).context("failed to load fallback checkpoint");
                        }
                    }
                }
                Err(error) => return Err(error).context("failed to load latest checkpoint"),
            }
        }

        let executor = Arc::new(TaskExecutor::new(
            callback_executor_threads,
            "table-callbacks",
        ));
        let mut registry = HashMap::with_capacity(tables.len());
        for table in tables {
            table.set_callback_executor(Arc::clone(&executor));
            let name = table.name().to_string();
            if registry.insert(name.clone(), table).is_some() {
                anyhow::bail!("duplicate table name '{name}'");
            }
        }

        let mut rng = rand::thread_rng();
        let tables_state_id = Uint128 {
            high: rng.gen(),
            low: rng.gen(),
        };

        Ok(Self {
            state: Arc::new(ServiceState {
                tables: registry,
                chunk_store,
                checkpointer,
                tables_state_id,
                _callback_executor: executor,
            }),
        })
    }

    /// Broadcast close to every table.
    pub fn close(&self) {
        for table in self.state.tables.values() {
            table.close();
        }
    }

    /// Serve on `0.0.0.0:{port}` until the process dies.
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        self.serve_with_shutdown(port, std::future::pending()).await
    }

    /// Serve until `signal` resolves, then close every table.
    pub async fn serve_with_shutdown(
        self,
        port: u16,
        signal: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{port}")
            .parse()
            .context("invalid listen address")?;
        let state = Arc::clone(&self.state);
        info!(%addr, tables = state.tables.len(), "replay buffer service listening");

        Server::builder()
            .add_service(ReplayBufferServer::new(self))
            .serve_with_shutdown(addr, signal)
            .await
            .context("gRPC server failed")?;

        for table in state.tables.values() {
            table.close();
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl ReplayBuffer for ReplayService {
    type InsertStreamStream =
        Pin<Box<dyn Stream<Item = Result<InsertStreamResponse, Status>> + Send>>;

    async fn insert_stream(
        &self,
        request: Request<Streaming<InsertStreamRequest>>,
    ) -> Result<Response<Self::InsertStreamStream>, Status> {
        let requests = request.into_inner();
        let (tx, rx) = mpsc::channel(1);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            streams::insert::run(state, requests, tx).await;
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    type SampleStreamStream =
        Pin<Box<dyn Stream<Item = Result<SampleStreamResponse, Status>> + Send>>;

    async fn sample_stream(
        &self,
        request: Request<Streaming<SampleStreamRequest>>,
    ) -> Result<Response<Self::SampleStreamStream>, Status> {
        let requests = request.into_inner();
        let (tx, rx) = mpsc::channel(1);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            streams::sample::run(state, requests, tx).await;
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    type InitializeConnectionStream =
        Pin<Box<dyn Stream<Item = Result<InitializeConnectionResponse, Status>> + Send>>;

    async fn initialize_connection(
        &self,
        request: Request<Streaming<InitializeConnectionRequest>>,
    ) -> Result<Response<Self::InitializeConnectionStream>, Status> {
        let peer = request.remote_addr();
        let requests = request.into_inner();
        let (tx, rx) = mpsc::channel(1);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            streams::connection::run(state, peer, requests, tx).await;
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn mutate_priorities(
        &self,
        request: Request<MutatePrioritiesRequest>,
    ) -> Result<Response<MutatePrioritiesResponse>, Status> {
        let request = request.into_inner();
        let table = self
            .state
            .table_by_name(&request.table)
            .ok_or_else(|| table_not_found(&request.table))?;
        let updates: Vec<(u64, f64)> = request
            .updates
            .iter()
            .map(|update| (update.key, update.priority))
            .collect();
        table
            .mutate_items(&updates, &request.delete_keys)
            .map_err(|error| table_status(&error))?;
        Ok(Response::new(MutatePrioritiesResponse {}))
    }

    async fn reset(
        &self,
        request: Request<ResetRequest>,
    ) -> Result<Response<ResetResponse>, Status> {
        let request = request.into_inner();
        let table = self
            .state
            .table_by_name(&request.table)
            .ok_or_else(|| table_not_found(&request.table))?;
        table.reset().map_err(|error| table_status(&error))?;
        Ok(Response::new(ResetResponse {}))
    }

    async fn checkpoint(
        &self,
        _request: Request<CheckpointRequest>,
    ) -> Result<Response<CheckpointResponse>, Status> {
        let Some(checkpointer) = self.state.checkpointer.clone() else {
            return Err(Status::invalid_argument(
                "no checkpointer configured for the replay service",
            ));
        };
        let tables: Vec<Arc<Table>> = self.state.tables.values().cloned().collect();
        let path = tokio::task::spawn_blocking(move || checkpointer.save(&tables, 1))
            .await
            .map_err(|error| Status::internal(format!("checkpoint task failed: {error}")))?
            .map_err(|error| Status::internal(error.to_string()))?;
        info!(path = %path.display(), "stored checkpoint");
        Ok(Response::new(CheckpointResponse {
            checkpoint_path: path.display().to_string(),
        }))
    }

    async fn server_info(
        &self,
        _request: Request<ServerInfoRequest>,
    ) -> Result<Response<ServerInfoResponse>, Status> {
        let table_info = self
            .state
            .tables
            .values()
            .map(|table| table.info())
            .collect();
        Ok(Response::new(ServerInfoResponse {
            table_info,
            tables_state_id: Some(self.state.tables_state_id.clone()),
        }))
    }
}
