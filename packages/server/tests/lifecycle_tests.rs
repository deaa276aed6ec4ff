//! End-to-end lifecycle scenarios: client over a duplex stream, MoM
//! over the mesh, Postgres in a container. All `#[ignore]` without a
//! local Docker daemon; run with `cargo test -- --ignored`.

mod common;

use std::time::Duration;

use batch_core::dispatch::reply::ReplyBody;
use batch_core::dispatch::request::{read_request, ReqBody, ReqType, StatusBody};
use batch_core::domains::attr::WireAttr;
use batch_core::exec::is_proto::IsMsg;
use batch_core::exec::mom::encode_is_frame;
use chrono::Utc;
use common::{db_harness, DbHarness, TestClient, TestMom, SERVER_NAME};

async fn create_node(h: &DbHarness, client: &mut TestClient, name: &str) {
    let reply = client
        .rpc(
            ReqType::Manager,
            ReqBody::Manager {
                cmd: 1,
                obj_type: 3,
                obj_name: name.to_string(),
                attrs: vec![WireAttr::with_resource("resources_available", "ncpus", "4")],
            },
        )
        .await;
    assert_eq!(reply.code, 0, "node create failed: {reply:?}");
    assert!(h.kernel.node(name).await.is_ok());
}

async fn submit_job(client: &mut TestClient) -> String {
    let reply = client
        .rpc(
            ReqType::QueueJob,
            ReqBody::QueueJob {
                jobid: String::new(),
                dest: "workq".into(),
                attrs: vec![
                    WireAttr::new("Job_Name", "j1"),
                    WireAttr::with_resource("Resource_List", "ncpus", "1"),
                    WireAttr::with_resource("Resource_List", "mem", "1gb"),
                    WireAttr::new("Hold_Types", "n"),
                ],
            },
        )
        .await;
    assert_eq!(reply.code, 0, "queue failed: {reply:?}");
    let ReplyBody::JobId(jobid) = reply.body else {
        panic!("expected jobid reply");
    };

    let reply = client
        .rpc(
            ReqType::JobScript,
            ReqBody::JobScript {
                jobid: jobid.clone(),
                chunk: b"#!/bin/sh\necho hi\n".to_vec(),
            },
        )
        .await;
    assert_eq!(reply.code, 0);

    let reply = client
        .rpc(
            ReqType::Commit,
            ReqBody::Commit {
                jobid: jobid.clone(),
            },
        )
        .await;
    assert_eq!(reply.code, 0, "commit failed: {reply:?}");
    jobid
}

async fn job_attr(client: &mut TestClient, jobid: &str, name: &str) -> Option<String> {
    let reply = client
        .rpc(
            ReqType::StatusJob,
            ReqBody::Status(StatusBody {
                id: jobid.to_string(),
                attrs: Vec::new(),
            }),
        )
        .await;
    if reply.code != 0 {
        return None;
    }
    let ReplyBody::Status(entries) = reply.body else {
        return None;
    };
    entries
        .first()?
        .attrs
        .iter()
        .find(|a| a.name == name)
        .map(|a| a.value.clone())
}

async fn wait_for_state(client: &mut TestClient, jobid: &str, want: &str) {
    for _ in 0..100 {
        if job_attr(client, jobid, "job_state").await.as_deref() == Some(want) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {jobid} never reached state {want}");
}

fn obit_frame(jobid: &str, exit_status: i64) -> bytes::Bytes {
    encode_is_frame(IsMsg::Jobobit, |chan| {
        chan.write_string(jobid);
        chan.write_int(exit_status);
        chan.write_uint(0); // no usage attrs
    })
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn queue_run_obit_reaches_finished() {
    let h = db_harness().await;
    let mut mom = TestMom::attach(&h.mesh, "n0");
    let mut client = TestClient::authenticated(&h.kernel, "alice").await;
    create_node(&h, &mut client, "n0").await;

    let jobid = submit_job(&mut client).await;
    assert_eq!(job_attr(&mut client, &jobid, "job_state").await.as_deref(), Some("Q"));

    let reply = client
        .rpc(
            ReqType::RunJob,
            ReqBody::RunJob {
                jobid: jobid.clone(),
                exec_vnode: "(n0:ncpus=1:mem=1gb)".into(),
            },
        )
        .await;
    assert_eq!(reply.code, 0, "run failed: {reply:?}");
    assert_eq!(job_attr(&mut client, &jobid, "job_state").await.as_deref(), Some("R"));

    // the launch fan-out reached the mom
    mom.expect_frame(|_| true).await;

    // mom reports completion
    mom.hub
        .send(SERVER_NAME, obit_frame(&jobid, 0))
        .await
        .unwrap();

    wait_for_state(&mut client, &jobid, "F").await;
    assert_eq!(
        job_attr(&mut client, &jobid, "exit_status").await.as_deref(),
        Some("0")
    );
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn preempt_by_suspend_keeps_resources_assigned() {
    let h = db_harness().await;
    let _mom = TestMom::attach(&h.mesh, "n0");
    let mut client = TestClient::authenticated(&h.kernel, "alice").await;
    create_node(&h, &mut client, "n0").await;

    let jobid = submit_job(&mut client).await;
    let reply = client
        .rpc(
            ReqType::RunJob,
            ReqBody::RunJob {
                jobid: jobid.clone(),
                exec_vnode: "(n0:ncpus=1)".into(),
            },
        )
        .await;
    assert_eq!(reply.code, 0);

    let reply = client
        .rpc(
            ReqType::PreemptJobs,
            ReqBody::PreemptJobs {
                jobids: vec![jobid.clone()],
            },
        )
        .await;
    let ReplyBody::PreemptJobs(entries) = reply.body else {
        panic!("expected preempt reply");
    };
    assert_eq!(entries, vec![(jobid.clone(), 'S')]);

    // still running, substate suspended, resources still assigned
    assert_eq!(job_attr(&mut client, &jobid, "job_state").await.as_deref(), Some("R"));
    assert_eq!(job_attr(&mut client, &jobid, "substate").await.as_deref(), Some("43"));
    let node = h.kernel.node("n0").await.unwrap();
    let node = node.lock().await;
    assert!(node.vnode("n0").unwrap().jobs.contains(&jobid));
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn asyrun_defers_then_acks_on_the_same_connection() {
    let h = db_harness().await;
    let _mom = TestMom::attach(&h.mesh, "n0");
    let mut client = TestClient::authenticated(&h.kernel, "alice").await;
    create_node(&h, &mut client, "n0").await;
    let jobid = submit_job(&mut client).await;

    let reply = client
        .rpc(
            ReqType::AsyrunJob,
            ReqBody::AsyrunJob {
                jobid: jobid.clone(),
                exec_vnode: "(n0:ncpus=1)".into(),
            },
        )
        .await;
    assert_eq!(reply.code, batch_core::dispatch::service::REPLY_CODE_DEFERRED);

    // the final acknowledgment arrives later, in order, as a push
    let ack = read_request(&mut client.chan).await.expect("ack push");
    match ack.body {
        ReqBody::AsyrunJobAck {
            jobid: acked,
            code,
        } => {
            assert_eq!(acked, jobid);
            assert_eq!(code, 0);
        }
        other => panic!("expected AsyrunJobAck, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn reservation_confirm_then_delete_cascades() {
    let h = db_harness().await;
    let mut client = TestClient::authenticated(&h.kernel, "alice").await;

    let start = Utc::now().timestamp() + 3600;
    let reply = client
        .rpc(
            ReqType::SubmitResv,
            ReqBody::SubmitResv {
                resvid: String::new(),
                attrs: vec![
                    WireAttr::new("reserve_start", start.to_string()),
                    WireAttr::new("reserve_end", (start + 3600).to_string()),
                    WireAttr::with_resource("Resource_List", "ncpus", "2"),
                ],
            },
        )
        .await;
    assert_eq!(reply.code, 0, "submit resv failed: {reply:?}");
    let ReplyBody::JobId(resvid) = reply.body else {
        panic!("expected resv id");
    };

    // unconfirmed, with its queue in place
    {
        let resv = h.kernel.resv(&resvid).await.unwrap();
        assert_eq!(
            resv.lock().await.state,
            batch_core::domains::resv::ResvState::Unconfirmed
        );
        assert!(h.kernel.queue(&resvid).await.is_ok());
    }

    let reply = client
        .rpc(
            ReqType::ConfirmResv,
            ReqBody::ConfirmResv {
                resvid: resvid.clone(),
                exec_vnode: "(n0:ncpus=2)".into(),
                start,
            },
        )
        .await;
    assert_eq!(reply.code, 0, "confirm failed: {reply:?}");
    {
        let resv = h.kernel.resv(&resvid).await.unwrap();
        assert_eq!(
            resv.lock().await.state,
            batch_core::domains::resv::ResvState::Confirmed
        );
    }

    let reply = client
        .rpc(
            ReqType::DeleteResv,
            ReqBody::DeleteResv {
                resvid: resvid.clone(),
            },
        )
        .await;
    assert_eq!(reply.code, 0);
    // no orphan queue, and a second delete reports unknown
    assert!(h.kernel.queue(&resvid).await.is_err());
    let reply = client
        .rpc(ReqType::DeleteResv, ReqBody::DeleteResv { resvid })
        .await;
    assert_eq!(reply.code, 15006);
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn move_to_remote_server_marks_moved_and_drops_row() {
    let h = db_harness().await;
    let mut other = TestMom::attach(&h.mesh, "other");
    let mut client = TestClient::authenticated(&h.kernel, "alice").await;
    let jobid = submit_job(&mut client).await;

    let reply = client
        .rpc(
            ReqType::MoveJob,
            ReqBody::MoveJob {
                jobid: jobid.clone(),
                destination: "workq@other".into(),
            },
        )
        .await;
    assert_eq!(reply.code, 0, "move failed: {reply:?}");

    // the remote server received the staged submission
    other.expect_frame(|_| true).await;

    assert_eq!(job_attr(&mut client, &jobid, "job_state").await.as_deref(), Some("M"));
    assert!(h.kernel.store.load_job(&jobid).await.is_err());
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn rerun_requeues_and_preserves_script() {
    let h = db_harness().await;
    let _mom = TestMom::attach(&h.mesh, "n0");
    let mut client = TestClient::authenticated(&h.kernel, "alice").await;
    create_node(&h, &mut client, "n0").await;
    let jobid = submit_job(&mut client).await;

    let reply = client
        .rpc(
            ReqType::RunJob,
            ReqBody::RunJob {
                jobid: jobid.clone(),
                exec_vnode: "(n0:ncpus=1)".into(),
            },
        )
        .await;
    assert_eq!(reply.code, 0);
    let run_count = job_attr(&mut client, &jobid, "run_count").await;
    assert_eq!(run_count.as_deref(), Some("1"));

    let reply = client
        .rpc(
            ReqType::Rerun,
            ReqBody::Rerun {
                jobid: jobid.clone(),
            },
        )
        .await;
    assert_eq!(reply.code, 0, "rerun failed: {reply:?}");

    assert_eq!(job_attr(&mut client, &jobid, "job_state").await.as_deref(), Some("Q"));
    assert_eq!(job_attr(&mut client, &jobid, "exit_status").await, None);
    let job = h.kernel.job(&jobid).await.unwrap();
    let job = job.lock().await;
    assert_eq!(job.header.rerun_count, 1);
    assert!(job.script.is_some());
}
