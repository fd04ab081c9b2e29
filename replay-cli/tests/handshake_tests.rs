//! In-process connection handshake over a real loopback server.

mod common;

use std::time::Duration;

use common::{connect, start_server, test_table};
use replay_core::handoff;
use replay_proto::InitializeConnectionRequest;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

fn hello(pid: i64, table_name: &str) -> InitializeConnectionRequest {
    InitializeConnectionRequest {
        pid,
        table_name: table_name.to_string(),
        ownership_transferred: false,
    }
}

fn confirmation(transferred: bool) -> InitializeConnectionRequest {
    InitializeConnectionRequest {
        pid: 0,
        table_name: String::new(),
        ownership_transferred: transferred,
    }
}

#[tokio::test]
async fn cross_process_clients_get_a_zero_address() {
    let port = start_server(vec![test_table("experience")], None).await;
    let mut client = connect(port).await;

    let (requests, rx) = mpsc::channel(4);
    let mut responses = client
        .initialize_connection(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();

    let foreign_pid = i64::from(std::process::id()) + 1;
    requests.send(hello(foreign_pid, "experience")).await.unwrap();

    let response = responses.message().await.unwrap().unwrap();
    assert_eq!(response.address, 0);
    // The stream then finishes cleanly with no further messages.
    assert!(responses.message().await.unwrap().is_none());
}

#[tokio::test]
async fn co_resident_clients_adopt_a_table_handle() {
    let port = start_server(vec![test_table("experience")], None).await;
    let mut client = connect(port).await;

    let (requests, rx) = mpsc::channel(4);
    let mut responses = client
        .initialize_connection(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();

    requests
        .send(hello(i64::from(std::process::id()), "experience"))
        .await
        .unwrap();

    let response = responses.message().await.unwrap().unwrap();
    assert!(response.address != 0);

    // The test shares the server's process, so the token resolves here.
    let table = handoff::adopt(response.address as u64).expect("token resolves to a table");
    assert_eq!(table.name(), "experience");

    requests.send(confirmation(true)).await.unwrap();
    assert!(responses.message().await.unwrap().is_none());

    // The registration is revoked once the stream tears down.
    for _ in 0..100 {
        if handoff::adopt(response.address as u64).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(handoff::adopt(response.address as u64).is_none());
    // The adopted handle stays usable regardless.
    assert_eq!(table.name(), "experience");
}

#[tokio::test]
async fn a_confirmation_without_the_flag_is_a_protocol_violation() {
    let port = start_server(vec![test_table("experience")], None).await;
    let mut client = connect(port).await;

    let (requests, rx) = mpsc::channel(4);
    let mut responses = client
        .initialize_connection(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();

    requests
        .send(hello(i64::from(std::process::id()), "experience"))
        .await
        .unwrap();
    let response = responses.message().await.unwrap().unwrap();
    assert!(response.address != 0);

    requests.send(confirmation(false)).await.unwrap();
    let status = responses.message().await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::Internal);
}

#[tokio::test]
async fn unknown_tables_are_not_found() {
    let port = start_server(vec![test_table("experience")], None).await;
    let mut client = connect(port).await;

    let (requests, rx) = mpsc::channel(4);
    let mut responses = client
        .initialize_connection(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();

    requests
        .send(hello(i64::from(std::process::id()), "nope"))
        .await
        .unwrap();
    let status = responses.message().await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}
