//! Object-store round trips against a containerized Postgres.
//!
//! Every test here needs a local Docker daemon, so they carry
//! `#[ignore]`; run them with `cargo test -- --ignored`.

mod common;

use batch_core::domains::attr::WireAttr;
use batch_core::domains::job::Job;
use batch_core::domains::queue::{Queue, QueueKind};
use batch_core::domains::resv::Resv;
use batch_core::kernel::SaveKind;
use chrono::{TimeDelta, Utc};
use common::db_harness;

fn sample_job(jobid: &str) -> Job {
    let mut job = Job::new(jobid, "alice@host", "workq", "host");
    job.attrs
        .apply(&WireAttr::new("Job_Name", "j1"), false)
        .unwrap();
    job.attrs
        .apply(&WireAttr::with_resource("Resource_List", "ncpus", "2"), false)
        .unwrap();
    job.attrs
        .apply(&WireAttr::with_resource("Resource_List", "mem", "1gb"), false)
        .unwrap();
    job.script = Some(b"#!/bin/sh\necho hi\n".to_vec());
    job.commit().unwrap();
    job
}

fn normalized(sparse: Vec<String>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = sparse
        .chunks_exact(2)
        .map(|kv| (kv[0].clone(), kv[1].clone()))
        .collect();
    pairs.sort();
    pairs
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn job_save_load_round_trips_up_to_attr_order() {
    let h = db_harness().await;
    let mut job = sample_job("1.host");
    job.header.queue_rank = 1;
    h.kernel
        .store
        .save_job(&mut job, SaveKind::Insert)
        .await
        .unwrap();

    let loaded = h.kernel.store.load_job("1.host").await.unwrap();
    assert_eq!(loaded.id(), "1.host");
    assert_eq!(loaded.header.state, job.header.state);
    assert_eq!(loaded.script, job.script);
    assert_eq!(
        normalized(loaded.attrs.to_sparse_full()),
        normalized(job.attrs.to_sparse_full()),
    );
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn find_jobs_orders_by_queue_rank() {
    let h = db_harness().await;
    for (i, id) in ["5.host", "3.host", "4.host"].iter().enumerate() {
        let mut job = sample_job(id);
        // insertion order deliberately different from rank order
        job.header.queue_rank = 10 - i as i64;
        h.kernel
            .store
            .save_job(&mut job, SaveKind::Insert)
            .await
            .unwrap();
    }
    let ids: Vec<String> = h
        .kernel
        .store
        .find_jobs()
        .await
        .unwrap()
        .map(|j| j.id().to_string())
        .collect();
    assert_eq!(ids, vec!["4.host", "3.host", "5.host"]);
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn quick_save_updates_header_only() {
    let h = db_harness().await;
    let mut job = sample_job("1.host");
    h.kernel
        .store
        .save_job(&mut job, SaveKind::Insert)
        .await
        .unwrap();

    job.hold("u").unwrap();
    h.kernel
        .store
        .save_job(&mut job, SaveKind::Quick)
        .await
        .unwrap();

    let loaded = h.kernel.store.load_job("1.host").await.unwrap();
    assert_eq!(loaded.header.state, batch_core::domains::job::JobState::Held);
    // the attribute column was not rewritten: the mirror still shows
    // the pre-hold state letter
    assert_eq!(
        loaded.attrs.get_by_name("job_state"),
        Some(&batch_core::domains::attr::AttrValue::Char('Q'))
    );
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn del_attrs_removes_named_pairs() {
    let h = db_harness().await;
    let mut job = sample_job("1.host");
    h.kernel
        .store
        .save_job(&mut job, SaveKind::Insert)
        .await
        .unwrap();
    h.kernel
        .store
        .del_job_attrs("1.host", &["Job_Name".to_string()])
        .await
        .unwrap();
    let loaded = h.kernel.store.load_job("1.host").await.unwrap();
    assert!(loaded.attrs.get_by_name("Job_Name").is_none());
    assert!(loaded.attrs.get_by_name("Resource_List").is_some());
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn add_update_attrs_merges_keywise() {
    let h = db_harness().await;
    let mut job = sample_job("1.host");
    h.kernel
        .store
        .save_job(&mut job, SaveKind::Insert)
        .await
        .unwrap();
    h.kernel
        .store
        .add_update_job_attrs(
            "1.host",
            &[
                "comment.".to_string(),
                "3.requeued by operator".to_string(),
            ],
        )
        .await
        .unwrap();
    let loaded = h.kernel.store.load_job("1.host").await.unwrap();
    assert_eq!(
        loaded.attrs.get_by_name("comment").map(|v| v.encode()),
        Some("requeued by operator".to_string())
    );
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn job_sequence_is_monotonic() {
    let h = db_harness().await;
    let a = h.kernel.store.next_job_seq("host").await.unwrap();
    let b = h.kernel.store.next_job_seq("host").await.unwrap();
    assert!(b > a);
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn queue_round_trips_by_creation_order() {
    let h = db_harness().await;
    for name in ["alpha", "beta"] {
        let mut q = Queue::new(name, QueueKind::Execution);
        h.kernel
            .store
            .save_queue(&mut q, SaveKind::Insert)
            .await
            .unwrap();
    }
    let names: Vec<String> = h
        .kernel
        .store
        .find_queues()
        .await
        .unwrap()
        .map(|q| q.name)
        .collect();
    // workq is created by rehydrate before the two above
    assert_eq!(names, vec!["workq", "alpha", "beta"]);
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn resv_queue_insert_is_atomic_under_the_latch() {
    let h = db_harness().await;
    let start = Utc::now() + TimeDelta::hours(1);
    let mut resv = Resv::new("R9.host", "alice@host", start, start + TimeDelta::hours(1));
    // collide with the existing workq row so the queue insert fails
    let mut queue = Queue::new("workq", QueueKind::Execution);
    let err = h
        .kernel
        .store
        .insert_resv_with_queue(&mut resv, &mut queue)
        .await;
    assert!(err.is_err());
    // the latch rolled the reservation row back too
    assert!(h.kernel.store.load_resv("R9.host").await.is_err());
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn pre_21_job_record_upgrades_on_load() {
    let h = db_harness().await;
    let mut job = sample_job("7.host");
    h.kernel
        .store
        .save_job(&mut job, SaveKind::Insert)
        .await
        .unwrap();
    // age the row back to the old record version with padded ids
    sqlx::query(
        "UPDATE pbs_job SET ji_jsversion = 20, ji_queue = 'workq   ' WHERE ji_jobid = '7.host'",
    )
    .execute(h.kernel.store.pool())
    .await
    .unwrap();

    let loaded = h.kernel.store.load_job("7.host").await.unwrap();
    assert_eq!(loaded.header.queue, "workq");
    // the upgrade re-saved the record at the current version
    let ver: i32 =
        sqlx::query_scalar("SELECT ji_jsversion FROM pbs_job WHERE ji_jobid = '7.host'")
            .fetch_one(h.kernel.store.pool())
            .await
            .unwrap();
    assert_eq!(ver, batch_core::kernel::store::JOB_RECORD_VERSION);
}
