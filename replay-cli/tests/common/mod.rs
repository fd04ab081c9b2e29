//! Shared helpers for the gRPC integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use replay_cli::grpc::ReplayService;
use replay_core::{Table, TableOptions};
use replay_proto::replay_buffer_client::ReplayBufferClient;
use replay_proto::{
    ChunkData, FlatTrajectory, InsertStreamRequest, InsertStreamResponse, PrioritizedItem,
};
use replay_storage::Checkpointer;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::Streaming;

pub fn test_table(name: &str) -> Arc<Table> {
    test_table_with(name, TableOptions::default())
}

pub fn test_table_with(name: &str, options: TableOptions) -> Arc<Table> {
    Table::new(name, options)
}

/// Start a test gRPC server and return the port
pub async fn start_server(
    tables: Vec<Arc<Table>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
) -> u16 {
    let service = ReplayService::new(tables, checkpointer, 4).expect("service to construct");

    // Find an available port
    let port = portpicker::pick_unused_port().expect("No available ports");

    // Start server in background
    tokio::spawn(async move {
        service.serve(port).await.ok();
    });

    // Give server time to start
    tokio::time::sleep(Duration::from_millis(100)).await;

    port
}

pub async fn connect(port: u16) -> ReplayBufferClient<Channel> {
    ReplayBufferClient::connect(format!("http://127.0.0.1:{port}"))
        .await
        .expect("Failed to connect to gRPC server")
}

pub fn chunk(key: u64, len: usize) -> ChunkData {
    ChunkData::new(key, vec![0u8; len])
}

pub fn item(key: u64, table: &str, priority: f64, chunk_keys: Vec<u64>) -> PrioritizedItem {
    PrioritizedItem {
        key,
        table: table.to_string(),
        priority,
        times_sampled: 0,
        inserted_at: None,
        flat_trajectory: Some(FlatTrajectory { chunk_keys }),
    }
}

pub fn insert_request(
    chunks: Vec<ChunkData>,
    items: Vec<PrioritizedItem>,
    keep_chunk_keys: Vec<u64>,
) -> InsertStreamRequest {
    InsertStreamRequest {
        chunks,
        items,
        keep_chunk_keys,
    }
}

/// Open an insert stream fed through a channel so requests can be sent one at
/// a time while acknowledgements are read back.
pub async fn open_insert_stream(
    client: &mut ReplayBufferClient<Channel>,
) -> (
    mpsc::Sender<InsertStreamRequest>,
    Streaming<InsertStreamResponse>,
) {
    let (tx, rx) = mpsc::channel(16);
    let responses = client
        .insert_stream(ReceiverStream::new(rx))
        .await
        .expect("insert stream to open")
        .into_inner();
    (tx, responses)
}

/// Read acknowledgement messages until `count` keys have arrived.
pub async fn collect_ack_keys(
    responses: &mut Streaming<InsertStreamResponse>,
    count: usize,
) -> Vec<u64> {
    let mut keys = Vec::new();
    while keys.len() < count {
        let message = tokio::time::timeout(Duration::from_secs(5), responses.message())
            .await
            .expect("acks to arrive in time")
            .expect("ack stream healthy")
            .expect("ack stream still open");
        keys.extend(message.keys);
    }
    keys
}
