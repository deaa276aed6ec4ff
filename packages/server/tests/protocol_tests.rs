//! Dispatcher behavior over duplex streams: handshake gating, reply
//! ordering, credential rounds. No database required; every path here
//! stays in memory.

mod common;

use batch_core::dispatch::request::{ReqBody, ReqType, StatusBody};
use batch_core::net::auth::SharedSecretValidator;
use common::{memory_kernel, TestClient, TEST_SECRET};

#[tokio::test]
async fn unauthenticated_request_is_refused_and_stream_closes() {
    let (kernel, _mesh_rx) = memory_kernel();
    let mut client = TestClient::connect(&kernel, "alice", 40000).await;

    client
        .send(
            ReqType::StatusJob,
            ReqBody::Status(StatusBody {
                id: "1.host".into(),
                attrs: Vec::new(),
            }),
        )
        .await;
    let reply = client.recv().await;
    assert_eq!(reply.code, 15012); // not authenticated

    // the server closed the stream; the next read fails
    let next = batch_core::dispatch::reply::read_reply(&mut client.chan).await;
    assert!(next.is_err());
}

#[tokio::test]
async fn resvport_handshake_from_high_port_is_rejected() {
    let (kernel, _mesh_rx) = memory_kernel();
    let mut client = TestClient::connect(&kernel, "alice", 42000).await;
    let reply = client
        .rpc(
            ReqType::Authenticate,
            ReqBody::Authenticate {
                method: "resvport".into(),
                encrypt_method: String::new(),
                client_port: 42000,
            },
        )
        .await;
    assert_eq!(reply.code, 15014); // bad credential
}

#[tokio::test]
async fn resvport_handshake_from_reserved_port_succeeds() {
    let (kernel, _mesh_rx) = memory_kernel();
    let mut client = TestClient::authenticated(&kernel, "alice").await;
    let reply = client
        .rpc(ReqType::StatusSvr, ReqBody::Status(StatusBody::default()))
        .await;
    assert_eq!(reply.code, 0);
}

#[tokio::test]
async fn external_method_needs_cred_round() {
    let (kernel, _mesh_rx) = memory_kernel();
    let mut client = TestClient::connect(&kernel, "alice", 40000).await;

    let reply = client
        .rpc(
            ReqType::Authenticate,
            ReqBody::Authenticate {
                method: "munge".into(),
                encrypt_method: String::new(),
                client_port: 40000,
            },
        )
        .await;
    assert_eq!(reply.code, 0);

    let validator = SharedSecretValidator::new("munge", TEST_SECRET);
    let reply = client
        .rpc(
            ReqType::Cred,
            ReqBody::Cred {
                method: "munge".into(),
                blob: validator.credential_for("alice"),
            },
        )
        .await;
    assert_eq!(reply.code, 0);

    let reply = client
        .rpc(ReqType::StatusSvr, ReqBody::Status(StatusBody::default()))
        .await;
    assert_eq!(reply.code, 0);
}

#[tokio::test]
async fn bad_cred_blob_closes_the_stream() {
    let (kernel, _mesh_rx) = memory_kernel();
    let mut client = TestClient::connect(&kernel, "alice", 40000).await;
    let reply = client
        .rpc(
            ReqType::Authenticate,
            ReqBody::Authenticate {
                method: "munge".into(),
                encrypt_method: String::new(),
                client_port: 40000,
            },
        )
        .await;
    assert_eq!(reply.code, 0);

    let reply = client
        .rpc(
            ReqType::Cred,
            ReqBody::Cred {
                method: "munge".into(),
                blob: b"forged".to_vec(),
            },
        )
        .await;
    assert_eq!(reply.code, 15014);
    let next = batch_core::dispatch::reply::read_reply(&mut client.chan).await;
    assert!(next.is_err());
}

#[tokio::test]
async fn pipelined_requests_get_replies_in_order() {
    let (kernel, _mesh_rx) = memory_kernel();
    let mut client = TestClient::authenticated(&kernel, "alice").await;

    // three status requests before reading anything back
    for _ in 0..3 {
        client
            .send(ReqType::StatusSvr, ReqBody::Status(StatusBody::default()))
            .await;
    }
    for _ in 0..3 {
        let reply = client.recv().await;
        assert_eq!(reply.code, 0);
        assert!(matches!(
            reply.body,
            batch_core::dispatch::reply::ReplyBody::Status(_)
        ));
    }
}

#[tokio::test]
async fn unknown_queue_is_a_typed_error() {
    let (kernel, _mesh_rx) = memory_kernel();
    let mut client = TestClient::authenticated(&kernel, "alice").await;
    let reply = client
        .rpc(
            ReqType::QueueJob,
            ReqBody::QueueJob {
                jobid: String::new(),
                dest: "noq".into(),
                attrs: Vec::new(),
            },
        )
        .await;
    assert_eq!(reply.code, 15005);
}

#[tokio::test]
async fn status_of_unknown_job_is_typed() {
    let (kernel, _mesh_rx) = memory_kernel();
    let mut client = TestClient::authenticated(&kernel, "alice").await;
    let reply = client
        .rpc(
            ReqType::StatusJob,
            ReqBody::Status(StatusBody {
                id: "9.host".into(),
                attrs: Vec::new(),
            }),
        )
        .await;
    assert_eq!(reply.code, 15004);
}

#[tokio::test]
async fn disconnect_closes_cleanly() {
    let (kernel, _mesh_rx) = memory_kernel();
    let mut client = TestClient::authenticated(&kernel, "alice").await;
    client.send(ReqType::Disconnect, ReqBody::Disconnect).await;
    let next = batch_core::dispatch::reply::read_reply(&mut client.chan).await;
    assert!(next.is_err());
}
