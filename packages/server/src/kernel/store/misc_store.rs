//! Queue, scheduler and server-object persistence.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::statements::{self as stmt, sql};
use super::{Cursor, ObjStore, SaveKind};
use crate::common::{BatchError, Result};
use crate::domains::attr::{AttrArray, AttrValue};
use crate::domains::queue::{Queue, QueueKind, QUEUE_ATTR_DEFS};
use crate::domains::sched::{Scheduler, SCHED_ATTR_DEFS};
use crate::domains::svr::{SvrObj, SVR_ATTR_DEFS};

#[derive(Debug, FromRow)]
struct DbQueueRow {
    qu_name: String,
    qu_type: i16,
    qu_creattm: DateTime<Utc>,
    #[allow(dead_code)]
    qu_savetm: DateTime<Utc>,
    #[allow(dead_code)]
    changecount: i64,
    attributes: Vec<String>,
}

impl DbQueueRow {
    fn into_queue(self) -> Result<Queue> {
        let mut attrs = AttrArray::new(QUEUE_ATTR_DEFS);
        attrs.from_sparse(&self.attributes, true)?;
        attrs.mark_clean();
        let kind = if self.qu_type == 1 {
            QueueKind::Route
        } else {
            QueueKind::Execution
        };
        let resv_id = match attrs.get_by_name("reservation") {
            Some(AttrValue::Str(r)) if !r.is_empty() => Some(r.clone()),
            _ => None,
        };
        let enabled = !matches!(attrs.get_by_name("enabled"), Some(AttrValue::Bool(false)));
        let started = !matches!(attrs.get_by_name("started"), Some(AttrValue::Bool(false)));
        Ok(Queue {
            name: self.qu_name,
            kind,
            enabled,
            started,
            jobs: Vec::new(),
            next_rank: 1,
            resv_id,
            attrs,
            creation: self.qu_creattm,
        })
    }
}

impl ObjStore {
    pub async fn save_queue(&self, queue: &mut Queue, kind: SaveKind) -> Result<()> {
        let qu_type: i16 = match queue.kind {
            QueueKind::Execution => 0,
            QueueKind::Route => 1,
        };
        match kind {
            SaveKind::Insert => {
                sqlx::query(sql(stmt::STMT_INSERT_QUE))
                    .bind(&queue.name)
                    .bind(qu_type)
                    .bind(queue.attrs.to_sparse_full())
                    .execute(self.pool())
                    .await?;
            }
            SaveKind::Full | SaveKind::Quick => {
                let done = sqlx::query(sql(stmt::STMT_UPDATE_QUE))
                    .bind(&queue.name)
                    .bind(qu_type)
                    .bind(queue.attrs.to_sparse_full())
                    .execute(self.pool())
                    .await?;
                if done.rows_affected() == 0 {
                    return Err(BatchError::UnknownQueue(queue.name.clone()));
                }
            }
        }
        queue.attrs.mark_clean();
        Ok(())
    }

    pub async fn load_queue(&self, name: &str) -> Result<Queue> {
        let row = sqlx::query_as::<_, DbQueueRow>(sql(stmt::STMT_SELECT_QUE))
            .bind(name)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| BatchError::UnknownQueue(name.to_string()))?;
        row.into_queue()
    }

    /// All queues, ascending by creation time.
    pub async fn find_queues(&self) -> Result<Cursor<Queue>> {
        let rows = sqlx::query_as::<_, DbQueueRow>(sql(stmt::STMT_FIND_QUES_ORDBY_CREATTM))
            .fetch_all(self.pool())
            .await?;
        let queues = rows
            .into_iter()
            .map(DbQueueRow::into_queue)
            .collect::<Result<Vec<_>>>()?;
        Ok(Cursor::new(queues))
    }

    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        sqlx::query(sql(stmt::STMT_DELETE_QUE))
            .bind(name)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn save_sched(&self, sched: &mut Scheduler, kind: SaveKind) -> Result<()> {
        let name = if matches!(kind, SaveKind::Insert) {
            stmt::STMT_INSERT_SCHED
        } else {
            stmt::STMT_UPDATE_SCHED
        };
        sqlx::query(sql(name))
            .bind(&sched.name)
            .bind(sched.attrs.to_sparse_full())
            .execute(self.pool())
            .await?;
        sched.attrs.mark_clean();
        Ok(())
    }

    pub async fn load_sched(&self, name: &str) -> Result<Scheduler> {
        #[derive(FromRow)]
        struct Row {
            sc_name: String,
            attributes: Vec<String>,
        }
        let row = sqlx::query_as::<_, Row>(sql(stmt::STMT_SELECT_SCHED))
            .bind(name)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| BatchError::UnknownSched(name.to_string()))?;
        let mut sched = Scheduler::new(row.sc_name);
        let mut attrs = AttrArray::new(SCHED_ATTR_DEFS);
        attrs.from_sparse(&row.attributes, true)?;
        attrs.mark_clean();
        sched.attrs = attrs;
        if let Some(text) = sched.attr_str("preempt_order") {
            sched.preempt_order = crate::domains::sched::parse_preempt_order(&text)?;
        }
        Ok(sched)
    }

    pub async fn load_scheds(&self) -> Result<Vec<String>> {
        #[derive(FromRow)]
        struct Row {
            sc_name: String,
        }
        let rows = sqlx::query_as::<_, Row>(sql(stmt::STMT_SELECT_SCHED_ALL))
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(|r| r.sc_name).collect())
    }

    pub async fn delete_sched(&self, name: &str) -> Result<()> {
        sqlx::query(sql(stmt::STMT_DELETE_SCHED))
            .bind(name)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn save_svr(&self, svr: &mut SvrObj, kind: SaveKind) -> Result<()> {
        let name = if matches!(kind, SaveKind::Insert) {
            stmt::STMT_INSERT_SVR
        } else {
            stmt::STMT_UPDATE_SVR
        };
        sqlx::query(sql(name))
            .bind(&svr.name)
            .bind(svr.next_job_seq)
            .bind(svr.attrs.to_sparse_full())
            .execute(self.pool())
            .await?;
        svr.attrs.mark_clean();
        Ok(())
    }

    pub async fn load_svr(&self, name: &str) -> Result<Option<SvrObj>> {
        #[derive(FromRow)]
        struct Row {
            sv_name: String,
            sv_nextseqid: i64,
            attributes: Vec<String>,
        }
        let Some(row) = sqlx::query_as::<_, Row>(sql(stmt::STMT_SELECT_SVR))
            .bind(name)
            .fetch_optional(self.pool())
            .await?
        else {
            return Ok(None);
        };
        let mut svr = SvrObj::new(row.sv_name);
        let mut attrs = AttrArray::new(SVR_ATTR_DEFS);
        attrs.from_sparse(&row.attributes, true)?;
        attrs.mark_clean();
        svr.attrs = attrs;
        svr.next_job_seq = row.sv_nextseqid;
        Ok(Some(svr))
    }
}
