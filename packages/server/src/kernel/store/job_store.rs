//! Job persistence.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::statements::{self as stmt, sql};
use super::{Cursor, ObjStore, SaveKind};
use crate::common::{BatchError, Result};
use crate::domains::attr::AttrArray;
use crate::domains::job::{Job, JobHeader, JobState, JobSubstate, JOB_ATTR_DEFS};

#[derive(Debug, FromRow)]
pub struct DbJobRow {
    pub ji_jobid: String,
    pub ji_state: i16,
    pub ji_substate: i16,
    pub ji_svrflags: i32,
    pub ji_queue: String,
    pub ji_destin: String,
    pub ji_exuid: i64,
    pub ji_exgid: i64,
    pub ji_stime: Option<DateTime<Utc>>,
    pub ji_exitstat: Option<i32>,
    pub ji_momaddr: Option<String>,
    pub ji_momport: i32,
    pub ji_qrank: i64,
    pub ji_sjindex: i64,
    pub ji_reruncnt: i32,
    pub ji_jsversion: i32,
    pub ji_creattm: DateTime<Utc>,
    pub ji_savetm: DateTime<Utc>,
    pub changecount: i64,
    pub attributes: Vec<String>,
}

impl DbJobRow {
    fn into_job(self, script: Option<Vec<u8>>) -> Result<Job> {
        let mut attrs = AttrArray::new(JOB_ATTR_DEFS);
        attrs.from_sparse(&self.attributes, true)?;
        attrs.mark_clean();
        let job = Job {
            header: JobHeader {
                jobid: self.ji_jobid,
                queue: self.ji_queue,
                origin_dest: self.ji_destin,
                state: JobState::from_db(self.ji_state)?,
                substate: JobSubstate::from_db(self.ji_substate)?,
                svrflags: self.ji_svrflags as u32,
                exec_uid: self.ji_exuid as u32,
                exec_gid: self.ji_exgid as u32,
                start_time: self.ji_stime,
                exit_status: self.ji_exitstat,
                mom_addr: self.ji_momaddr,
                mom_port: self.ji_momport as u16,
                queue_rank: self.ji_qrank,
                subjob_index: self.ji_sjindex,
                rerun_count: self.ji_reruncnt,
            },
            attrs,
            script,
            tasks: Vec::new(),
            committed: true,
            creation: self.ji_creattm,
            modify_time: self.ji_savetm,
        };
        job.check_invariants()?;
        Ok(job)
    }
}

impl ObjStore {
    pub async fn save_job(&self, job: &mut Job, kind: SaveKind) -> Result<()> {
        let h = &job.header;
        match kind {
            SaveKind::Insert => {
                sqlx::query(sql(stmt::STMT_INSERT_JOB))
                    .bind(&h.jobid)
                    .bind(h.state.to_db())
                    .bind(h.substate.to_db())
                    .bind(h.svrflags as i32)
                    .bind(&h.queue)
                    .bind(&h.origin_dest)
                    .bind(i64::from(h.exec_uid))
                    .bind(i64::from(h.exec_gid))
                    .bind(h.start_time)
                    .bind(h.exit_status)
                    .bind(&h.mom_addr)
                    .bind(i32::from(h.mom_port))
                    .bind(h.queue_rank)
                    .bind(h.subjob_index)
                    .bind(h.rerun_count)
                    .bind(super::JOB_RECORD_VERSION)
                    .bind(job.attrs.to_sparse_full())
                    .execute(self.pool())
                    .await?;
                if let Some(script) = &job.script {
                    self.save_job_script(&h.jobid, script).await?;
                }
                job.attrs.mark_clean();
                Ok(())
            }
            SaveKind::Full => {
                let done = sqlx::query(sql(stmt::STMT_UPDATE_JOB))
                    .bind(&h.jobid)
                    .bind(h.state.to_db())
                    .bind(h.substate.to_db())
                    .bind(h.svrflags as i32)
                    .bind(&h.queue)
                    .bind(&h.origin_dest)
                    .bind(i64::from(h.exec_uid))
                    .bind(i64::from(h.exec_gid))
                    .bind(h.start_time)
                    .bind(h.exit_status)
                    .bind(&h.mom_addr)
                    .bind(i32::from(h.mom_port))
                    .bind(h.queue_rank)
                    .bind(h.subjob_index)
                    .bind(h.rerun_count)
                    .bind(super::JOB_RECORD_VERSION)
                    .bind(job.attrs.to_sparse_full())
                    .execute(self.pool())
                    .await?;
                if done.rows_affected() == 0 {
                    return Err(BatchError::UnknownJob(h.jobid.clone()));
                }
                job.attrs.mark_clean();
                Ok(())
            }
            SaveKind::Quick => {
                let jobid = h.jobid.clone();
                let state = h.state.to_db();
                let substate = h.substate.to_db();
                let svrflags = h.svrflags as i32;
                let queue = h.queue.clone();
                let exitstat = h.exit_status;
                let momaddr = h.mom_addr.clone();
                let momport = i32::from(h.mom_port);
                let stime = h.start_time;
                let reruncnt = h.rerun_count;
                let pool = self.pool().clone();
                self.with_quick_retry(move || {
                    let pool = pool.clone();
                    let jobid = jobid.clone();
                    let queue = queue.clone();
                    let momaddr = momaddr.clone();
                    async move {
                        let done = sqlx::query(sql(stmt::STMT_UPDATE_JOB_QUICK))
                            .bind(&jobid)
                            .bind(state)
                            .bind(substate)
                            .bind(svrflags)
                            .bind(&queue)
                            .bind(exitstat)
                            .bind(&momaddr)
                            .bind(momport)
                            .bind(stime)
                            .bind(reruncnt)
                            .execute(&pool)
                            .await
                            .map_err(BatchError::from)?;
                        if done.rows_affected() == 0 {
                            return Err(BatchError::UnknownJob(jobid));
                        }
                        Ok(())
                    }
                })
                .await
            }
        }
    }

    pub async fn load_job(&self, jobid: &str) -> Result<Job> {
        let mut row = sqlx::query_as::<_, DbJobRow>(sql(stmt::STMT_SELECT_JOB))
            .bind(jobid)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| BatchError::UnknownJob(jobid.to_string()))?;
        let upgraded = super::upgrade_job_row(&mut row);
        let script = self.load_job_script(&row.ji_jobid).await?;
        let mut job = row.into_job(script)?;
        if upgraded {
            self.save_job(&mut job, SaveKind::Full).await?;
        }
        Ok(job)
    }

    /// All jobs, ascending by (queue rank, sub-job index).
    pub async fn find_jobs(&self) -> Result<Cursor<Job>> {
        let rows = sqlx::query_as::<_, DbJobRow>(sql(stmt::STMT_FIND_JOBS_ORDBY_QRANK))
            .fetch_all(self.pool())
            .await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for mut row in rows {
            super::upgrade_job_row(&mut row);
            let script = self.load_job_script(&row.ji_jobid).await?;
            jobs.push(row.into_job(script)?);
        }
        Ok(Cursor::new(jobs))
    }

    pub async fn delete_job(&self, jobid: &str) -> Result<()> {
        sqlx::query(sql(stmt::STMT_DELETE_JOBSCR))
            .bind(jobid)
            .execute(self.pool())
            .await?;
        sqlx::query(sql(stmt::STMT_DELETE_JOB))
            .bind(jobid)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn save_job_script(&self, jobid: &str, script: &[u8]) -> Result<()> {
        sqlx::query(sql(stmt::STMT_INSERT_JOBSCR))
            .bind(jobid)
            .bind(script)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn load_job_script(&self, jobid: &str) -> Result<Option<Vec<u8>>> {
        let script: Option<Vec<u8>> = sqlx::query_scalar(sql(stmt::STMT_SELECT_JOBSCR))
            .bind(jobid)
            .fetch_optional(self.pool())
            .await?;
        Ok(script)
    }

    /// Replace the sparse attribute column only.
    pub async fn update_job_attrs_only(&self, jobid: &str, attributes: &[String]) -> Result<()> {
        sqlx::query(sql(stmt::STMT_UPDATE_JOB_ATTRSONLY))
            .bind(jobid)
            .bind(attributes)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Remove named attributes from the stored sparse array.
    pub async fn del_job_attrs(&self, jobid: &str, names: &[String]) -> Result<()> {
        let row = sqlx::query_as::<_, DbJobRow>(sql(stmt::STMT_SELECT_JOB))
            .bind(jobid)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| BatchError::UnknownJob(jobid.to_string()))?;
        let kept: Vec<String> = row
            .attributes
            .chunks_exact(2)
            .filter(|kv| {
                let name = kv[0].split_once('.').map(|(n, _)| n).unwrap_or(&kv[0]);
                !names.iter().any(|n| n == name)
            })
            .flat_map(|kv| kv.to_vec())
            .collect();
        self.update_job_attrs_only(jobid, &kept).await
    }

    /// Merge attribute pairs into the stored sparse array, key-wise.
    pub async fn add_update_job_attrs(&self, jobid: &str, pairs: &[String]) -> Result<()> {
        if pairs.len() % 2 != 0 {
            return Err(BatchError::Invariant("odd attribute pair list".into()));
        }
        let row = sqlx::query_as::<_, DbJobRow>(sql(stmt::STMT_SELECT_JOB))
            .bind(jobid)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| BatchError::UnknownJob(jobid.to_string()))?;
        let mut merged: Vec<(String, String)> = row
            .attributes
            .chunks_exact(2)
            .map(|kv| (kv[0].clone(), kv[1].clone()))
            .collect();
        for kv in pairs.chunks_exact(2) {
            match merged.iter_mut().find(|(k, _)| *k == kv[0]) {
                Some((_, v)) => *v = kv[1].clone(),
                None => merged.push((kv[0].clone(), kv[1].clone())),
            }
        }
        let flat: Vec<String> = merged.into_iter().flat_map(|(k, v)| [k, v]).collect();
        self.update_job_attrs_only(jobid, &flat).await
    }

    /// Claim the next job sequence number from the server row.
    pub async fn next_job_seq(&self, server: &str) -> Result<i64> {
        let seq: i64 = sqlx::query_scalar(sql(stmt::STMT_SELECT_NEXT_SEQID))
            .bind(server)
            .fetch_one(self.pool())
            .await?;
        Ok(seq)
    }
}
