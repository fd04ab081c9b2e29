//! Unary operations and checkpoint/restart behavior over a real server.

mod common;

use std::sync::Arc;

use common::{
    chunk, collect_ack_keys, connect, insert_request, item, open_insert_stream, start_server,
    test_table,
};
use replay_proto::{
    CheckpointRequest, KeyWithPriority, MutatePrioritiesRequest, ResetRequest, ServerInfoRequest,
};
use replay_storage::{Checkpointer, FileCheckpointer};

#[tokio::test]
async fn server_info_lists_tables_and_state_id() {
    let port = start_server(vec![test_table("a"), test_table("b")], None).await;
    let mut client = connect(port).await;

    let info = client
        .server_info(ServerInfoRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.table_info.len(), 2);
    let mut names: Vec<&str> = info
        .table_info
        .iter()
        .map(|table| table.name.as_str())
        .collect();
    names.sort_unstable();
    assert_eq!(names, vec!["a", "b"]);

    let id = info.tables_state_id.expect("state id is always present");
    assert!(id.high != 0 || id.low != 0);
}

#[tokio::test]
async fn mutate_priorities_on_unknown_table_is_not_found() {
    let port = start_server(vec![test_table("experience")], None).await;
    let mut client = connect(port).await;

    let status = client
        .mutate_priorities(MutatePrioritiesRequest {
            table: "nope".to_string(),
            updates: vec![KeyWithPriority {
                key: 1,
                priority: 2.0,
            }],
            delete_keys: vec![],
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn mutate_priorities_deletes_items() {
    let port = start_server(vec![test_table("experience")], None).await;
    let mut client = connect(port).await;

    let (requests, mut responses) = open_insert_stream(&mut client).await;
    for key in 1..=2u64 {
        requests
            .send(insert_request(
                vec![chunk(key, 32)],
                vec![item(key, "experience", 1.0, vec![key])],
                vec![],
            ))
            .await
            .unwrap();
    }
    collect_ack_keys(&mut responses, 2).await;

    client
        .mutate_priorities(MutatePrioritiesRequest {
            table: "experience".to_string(),
            updates: vec![],
            delete_keys: vec![1],
        })
        .await
        .unwrap();

    let info = client
        .server_info(ServerInfoRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.table_info[0].current_size, 1);
}

#[tokio::test]
async fn reset_empties_a_table() {
    let port = start_server(vec![test_table("experience")], None).await;
    let mut client = connect(port).await;

    let (requests, mut responses) = open_insert_stream(&mut client).await;
    requests
        .send(insert_request(
            vec![chunk(1, 32)],
            vec![item(1, "experience", 1.0, vec![1])],
            vec![],
        ))
        .await
        .unwrap();
    collect_ack_keys(&mut responses, 1).await;

    client
        .reset(ResetRequest {
            table: "experience".to_string(),
        })
        .await
        .unwrap();

    let info = client
        .server_info(ServerInfoRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.table_info[0].current_size, 0);
}

#[tokio::test]
async fn reset_on_unknown_table_is_not_found() {
    let port = start_server(vec![test_table("experience")], None).await;
    let mut client = connect(port).await;
    let status = client
        .reset(ResetRequest {
            table: "nope".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn checkpoint_without_a_checkpointer_is_invalid() {
    let port = start_server(vec![test_table("experience")], None).await;
    let mut client = connect(port).await;
    let status = client.checkpoint(CheckpointRequest {}).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn checkpoint_then_restart_restores_state_with_a_fresh_state_id() {
    let dir = tempfile::tempdir().unwrap();

    let checkpointer: Arc<dyn Checkpointer> = Arc::new(FileCheckpointer::new(dir.path()));
    let port = start_server(vec![test_table("experience")], Some(Arc::clone(&checkpointer))).await;
    let mut client = connect(port).await;

    let (requests, mut responses) = open_insert_stream(&mut client).await;
    for key in 1..=2u64 {
        requests
            .send(insert_request(
                vec![chunk(key, 32)],
                vec![item(key, "experience", 1.5, vec![key])],
                vec![],
            ))
            .await
            .unwrap();
    }
    collect_ack_keys(&mut responses, 2).await;

    let saved = client
        .checkpoint(CheckpointRequest {})
        .await
        .unwrap()
        .into_inner();
    assert!(!saved.checkpoint_path.is_empty());

    let first_info = client
        .server_info(ServerInfoRequest {})
        .await
        .unwrap()
        .into_inner();
    let first_id = first_info.tables_state_id.unwrap();

    // A second server over the same checkpoint root picks the state back up.
    let restarted: Arc<dyn Checkpointer> = Arc::new(FileCheckpointer::new(dir.path()));
    let new_port = start_server(vec![test_table("experience")], Some(restarted)).await;
    let mut new_client = connect(new_port).await;

    let second_info = new_client
        .server_info(ServerInfoRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(second_info.table_info[0].current_size, 2);
    assert_ne!(second_info.tables_state_id.unwrap(), first_id);
}

#[tokio::test]
async fn a_fallback_checkpoint_seeds_an_empty_root() {
    let seed_dir = tempfile::tempdir().unwrap();
    let seed: Arc<dyn Checkpointer> = Arc::new(FileCheckpointer::new(seed_dir.path()));
    let port = start_server(vec![test_table("experience")], Some(Arc::clone(&seed))).await;
    let mut client = connect(port).await;

    let (requests, mut responses) = open_insert_stream(&mut client).await;
    requests
        .send(insert_request(
            vec![chunk(1, 32)],
            vec![item(1, "experience", 1.0, vec![1])],
            vec![],
        ))
        .await
        .unwrap();
    collect_ack_keys(&mut responses, 1).await;
    let saved = client
        .checkpoint(CheckpointRequest {})
        .await
        .unwrap()
        .into_inner();

    // Fresh root, fallback pointing at the other run's checkpoint file.
    let fresh_dir = tempfile::tempdir().unwrap();
    let fallback: Arc<dyn Checkpointer> = Arc::new(
        FileCheckpointer::new(fresh_dir.path()).with_fallback(saved.checkpoint_path),
    );
    let new_port = start_server(vec![test_table("experience")], Some(fallback)).await;
    let mut new_client = connect(new_port).await;

    let info = new_client
        .server_info(ServerInfoRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.table_info[0].current_size, 1);
}

#[tokio::test]
async fn an_empty_checkpoint_root_starts_an_empty_service() {
    let dir = tempfile::tempdir().unwrap();
    let checkpointer: Arc<dyn Checkpointer> = Arc::new(FileCheckpointer::new(dir.path()));
    let port = start_server(vec![test_table("experience")], Some(checkpointer)).await;
    let mut client = connect(port).await;

    let info = client
        .server_info(ServerInfoRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.table_info[0].current_size, 0);
}
