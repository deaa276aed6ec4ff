//! Reservation persistence.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::statements::{self as stmt, sql};
use super::{Cursor, ObjStore, SaveKind};
use crate::common::{BatchError, Result};
use crate::domains::attr::AttrArray;
use crate::domains::resv::{Resv, ResvState, RESV_ATTR_DEFS};

#[derive(Debug, FromRow)]
struct DbResvRow {
    ri_resvid: String,
    ri_state: i16,
    ri_queue: String,
    ri_stime: DateTime<Utc>,
    ri_etime: DateTime<Utc>,
    ri_creattm: DateTime<Utc>,
    #[allow(dead_code)]
    ri_savetm: DateTime<Utc>,
    #[allow(dead_code)]
    changecount: i64,
    attributes: Vec<String>,
}

impl DbResvRow {
    fn into_resv(self) -> Result<Resv> {
        let mut attrs = AttrArray::new(RESV_ATTR_DEFS);
        attrs.from_sparse(&self.attributes, true)?;
        attrs.mark_clean();
        let owner = match attrs.get_by_name("Reserve_Owner") {
            Some(v) => v.encode(),
            None => String::new(),
        };
        let exec_vnode = attrs.get_by_name("resv_nodes").map(|v| v.encode());
        Ok(Resv {
            resvid: self.ri_resvid,
            owner,
            queue: self.ri_queue,
            state: ResvState::from_db(self.ri_state)?,
            start: self.ri_stime,
            end: self.ri_etime,
            exec_vnode,
            attrs,
            occurrences_done: Default::default(),
            creation: self.ri_creattm,
        })
    }
}

impl ObjStore {
    pub async fn save_resv(&self, resv: &mut Resv, kind: SaveKind) -> Result<()> {
        match kind {
            SaveKind::Insert => {
                sqlx::query(sql(stmt::STMT_INSERT_RESV))
                    .bind(&resv.resvid)
                    .bind(resv.state.to_db())
                    .bind(&resv.queue)
                    .bind(resv.start)
                    .bind(resv.end)
                    .bind(resv.attrs.to_sparse_full())
                    .execute(self.pool())
                    .await?;
                resv.attrs.mark_clean();
            }
            SaveKind::Full => {
                let done = sqlx::query(sql(stmt::STMT_UPDATE_RESV))
                    .bind(&resv.resvid)
                    .bind(resv.state.to_db())
                    .bind(&resv.queue)
                    .bind(resv.start)
                    .bind(resv.end)
                    .bind(resv.attrs.to_sparse_full())
                    .execute(self.pool())
                    .await?;
                if done.rows_affected() == 0 {
                    return Err(BatchError::UnknownResv(resv.resvid.clone()));
                }
                resv.attrs.mark_clean();
            }
            SaveKind::Quick => {
                let resvid = resv.resvid.clone();
                let state = resv.state.to_db();
                let pool = self.pool().clone();
                self.with_quick_retry(move || {
                    let pool = pool.clone();
                    let resvid = resvid.clone();
                    async move {
                        sqlx::query(sql(stmt::STMT_UPDATE_RESV_QUICK))
                            .bind(&resvid)
                            .bind(state)
                            .execute(&pool)
                            .await
                            .map_err(BatchError::from)?;
                        Ok(())
                    }
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Insert the reservation and its queue in one transaction: a
    /// failure at either nesting level arms the latch and the
    /// outermost commit rolls both back.
    pub async fn insert_resv_with_queue(
        &self,
        resv: &mut Resv,
        queue: &mut crate::domains::queue::Queue,
    ) -> Result<()> {
        let mut tx = self.begin().await?;

        tx.nest();
        let resv_result = sqlx::query(sql(stmt::STMT_INSERT_RESV))
            .bind(&resv.resvid)
            .bind(resv.state.to_db())
            .bind(&resv.queue)
            .bind(resv.start)
            .bind(resv.end)
            .bind(resv.attrs.to_sparse_full())
            .execute(tx.conn())
            .await
            .map_err(BatchError::from);
        tx.unnest(resv_result.is_ok());

        tx.nest();
        let qu_type: i16 = match queue.kind {
            crate::domains::queue::QueueKind::Execution => 0,
            crate::domains::queue::QueueKind::Route => 1,
        };
        let queue_result = sqlx::query(sql(stmt::STMT_INSERT_QUE))
            .bind(&queue.name)
            .bind(qu_type)
            .bind(queue.attrs.to_sparse_full())
            .execute(tx.conn())
            .await
            .map_err(BatchError::from);
        tx.unnest(queue_result.is_ok());

        if tx.finish().await? {
            resv.attrs.mark_clean();
            queue.attrs.mark_clean();
            Ok(())
        } else {
            resv_result?;
            queue_result?;
            Err(BatchError::StoreBusy)
        }
    }

    pub async fn load_resv(&self, resvid: &str) -> Result<Resv> {
        let row = sqlx::query_as::<_, DbResvRow>(sql(stmt::STMT_SELECT_RESV))
            .bind(resvid)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| BatchError::UnknownResv(resvid.to_string()))?;
        row.into_resv()
    }

    /// All reservations, ascending by creation time.
    pub async fn find_resvs(&self) -> Result<Cursor<Resv>> {
        let rows = sqlx::query_as::<_, DbResvRow>(sql(stmt::STMT_FINDRESVS_ORDBY_CREATTM))
            .fetch_all(self.pool())
            .await?;
        let resvs = rows
            .into_iter()
            .map(DbResvRow::into_resv)
            .collect::<Result<Vec<_>>>()?;
        Ok(Cursor::new(resvs))
    }

    pub async fn delete_resv(&self, resvid: &str) -> Result<()> {
        sqlx::query(sql(stmt::STMT_DELETE_RESV))
            .bind(resvid)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
