//! Nested transactions with a rollback latch.
//!
//! Save paths nest begin/commit freely; a failure at any nesting level
//! arms the latch and the outermost commit rolls the whole transaction
//! back instead.

use sqlx::{PgConnection, Postgres, Transaction};

use crate::common::Result;

pub struct StoreTx<'c> {
    tx: Transaction<'c, Postgres>,
    depth: u32,
    rollback_latch: bool,
}

impl<'c> StoreTx<'c> {
    pub(crate) async fn begin(pool: &'c sqlx::PgPool) -> Result<StoreTx<'c>> {
        let tx = pool.begin().await?;
        Ok(Self {
            tx,
            depth: 0,
            rollback_latch: false,
        })
    }

    /// Enter a nested level.
    pub fn nest(&mut self) {
        self.depth += 1;
    }

    /// Leave a nested level; a failed level arms the latch.
    pub fn unnest(&mut self, ok: bool) {
        if !ok {
            self.rollback_latch = true;
        }
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn fail(&mut self) {
        self.rollback_latch = true;
    }

    pub fn is_armed(&self) -> bool {
        self.rollback_latch
    }

    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Outermost commit: rolls back when the latch is armed.
    pub async fn finish(self) -> Result<bool> {
        if self.rollback_latch {
            self.tx.rollback().await?;
            Ok(false)
        } else {
            self.tx.commit().await?;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    // Latch behavior is covered with a live database in
    // tests/store_roundtrip.rs; the pure nesting arithmetic is trivial
    // enough to read.
}
