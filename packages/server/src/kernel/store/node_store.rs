//! Node persistence: one row per vnode, grouped by host on load.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::statements::{self as stmt, sql};
use super::{Cursor, ObjStore, SaveKind};
use crate::common::{BatchError, Result};
use crate::domains::attr::{AttrArray, AttrValue, SetOp, WireAttr};
use crate::domains::node::{Node, Sharing, Vnode, NODE_ATTR_DEFS};

#[derive(Debug, FromRow)]
struct DbNodeRow {
    nd_name: String,
    nd_index: i64,
    nd_hostname: String,
    nd_port: i32,
    nd_state: i32,
    nd_sharing: String,
    nd_creattm: DateTime<Utc>,
    #[allow(dead_code)]
    nd_savetm: DateTime<Utc>,
    #[allow(dead_code)]
    changecount: i64,
    attributes: Vec<String>,
}

fn resources_to_sparse(prefix: &str, resources: &[(String, AttrValue)]) -> Vec<String> {
    let mut out = Vec::new();
    for (name, v) in resources {
        out.push(format!("{prefix}.{name}"));
        out.push(format!("3.{}", v.encode()));
    }
    out
}

fn sparse_to_resources(pairs: &[String], prefix: &str) -> Result<Vec<(String, AttrValue)>> {
    let mut out = Vec::new();
    for kv in pairs.chunks_exact(2) {
        let Some((name, resource)) = kv[0].split_once('.') else {
            continue;
        };
        if name != prefix || resource.is_empty() {
            continue;
        }
        let Some((_, value)) = kv[1].split_once('.') else {
            continue;
        };
        let ty = crate::domains::attr::resource_type(resource);
        out.push((resource.to_string(), ty.decode(value)?));
    }
    Ok(out)
}

impl ObjStore {
    pub async fn save_node(&self, node: &mut Node, kind: SaveKind) -> Result<()> {
        for vnode in &node.vnodes {
            let mut attributes = resources_to_sparse("resources_available", &vnode.resources_available);
            attributes.extend(resources_to_sparse(
                "resources_assigned",
                &vnode.resources_assigned,
            ));
            match kind {
                SaveKind::Insert => {
                    sqlx::query(sql(stmt::STMT_INSERT_NODE))
                        .bind(&vnode.name)
                        .bind(node.index)
                        .bind(&node.mom_host)
                        .bind(i32::from(node.mom_port))
                        .bind(vnode.state as i32)
                        .bind(vnode.sharing.as_str())
                        .bind(&attributes)
                        .execute(self.pool())
                        .await?;
                }
                SaveKind::Full | SaveKind::Quick => {
                    let done = sqlx::query(sql(stmt::STMT_UPDATE_NODE))
                        .bind(&vnode.name)
                        .bind(node.index)
                        .bind(&node.mom_host)
                        .bind(i32::from(node.mom_port))
                        .bind(vnode.state as i32)
                        .bind(vnode.sharing.as_str())
                        .bind(&attributes)
                        .execute(self.pool())
                        .await?;
                    if done.rows_affected() == 0 {
                        return Err(BatchError::UnknownNode(vnode.name.clone()));
                    }
                }
            }
        }
        node.attrs.mark_clean();
        Ok(())
    }

    pub async fn load_node(&self, name: &str) -> Result<Node> {
        let row = sqlx::query_as::<_, DbNodeRow>(sql(stmt::STMT_SELECT_NODE))
            .bind(name)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| BatchError::UnknownNode(name.to_string()))?;
        rows_to_node(vec![row])
    }

    /// All nodes ascending by creation time, vnodes grouped by host.
    pub async fn find_nodes(&self) -> Result<Cursor<Node>> {
        let rows = sqlx::query_as::<_, DbNodeRow>(sql(stmt::STMT_FIND_NODES_ORDBY_CREATTM))
            .fetch_all(self.pool())
            .await?;
        group_nodes(rows)
    }

    /// Secondary ordering by node index.
    pub async fn find_nodes_by_index(&self) -> Result<Cursor<Node>> {
        let rows = sqlx::query_as::<_, DbNodeRow>(sql(stmt::STMT_FIND_NODES_ORDBY_INDEX))
            .fetch_all(self.pool())
            .await?;
        group_nodes(rows)
    }

    pub async fn delete_node(&self, name: &str) -> Result<()> {
        sqlx::query(sql(stmt::STMT_DELETE_NODE))
            .bind(name)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Record when a MoM's state file was last current.
    pub async fn save_mominfo_time(&self, mom: &str, time: DateTime<Utc>) -> Result<()> {
        sqlx::query(sql(stmt::STMT_UPSERT_MOMINFO_TIME))
            .bind(mom)
            .bind(time)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn load_mominfo_time(&self, mom: &str) -> Result<Option<DateTime<Utc>>> {
        let t = sqlx::query_scalar(sql(stmt::STMT_SELECT_MOMINFO_TIME))
            .bind(mom)
            .fetch_optional(self.pool())
            .await?;
        Ok(t)
    }
}

fn row_to_vnode(row: &DbNodeRow) -> Result<Vnode> {
    Ok(Vnode {
        name: row.nd_name.clone(),
        state: row.nd_state as u32,
        sharing: Sharing::parse(&row.nd_sharing)?,
        resources_available: sparse_to_resources(&row.attributes, "resources_available")?,
        resources_assigned: sparse_to_resources(&row.attributes, "resources_assigned")?,
        jobs: Vec::new(),
    })
}

fn rows_to_node(rows: Vec<DbNodeRow>) -> Result<Node> {
    let first = rows
        .first()
        .ok_or_else(|| BatchError::Invariant("empty node group".into()))?;
    let mut node = Node {
        name: first.nd_hostname.clone(),
        mom_host: first.nd_hostname.clone(),
        mom_port: first.nd_port as u16,
        index: first.nd_index,
        vnodes: Vec::new(),
        attrs: AttrArray::new(NODE_ATTR_DEFS),
        creation: first.nd_creattm,
    };
    node.attrs.apply(
        &WireAttr {
            name: "Mom".into(),
            resource: None,
            value: first.nd_hostname.clone(),
            flags: 0,
            op: SetOp::Set,
        },
        false,
    )?;
    for row in &rows {
        node.vnodes.push(row_to_vnode(row)?);
    }
    Ok(node)
}

fn group_nodes(rows: Vec<DbNodeRow>) -> Result<Cursor<Node>> {
    let mut groups: Vec<(String, Vec<DbNodeRow>)> = Vec::new();
    for row in rows {
        match groups.iter_mut().find(|(h, _)| *h == row.nd_hostname) {
            Some((_, g)) => g.push(row),
            None => groups.push((row.nd_hostname.clone(), vec![row])),
        }
    }
    let nodes = groups
        .into_iter()
        .map(|(_, g)| rows_to_node(g))
        .collect::<Result<Vec<_>>>()?;
    Ok(Cursor::new(nodes))
}
