//! The named statement set.
//!
//! Every query the store runs has a stable name; the SQL text lives in
//! one table so the statement surface is auditable in one place.
//! Ordered finds carry the ordering in the name.

pub const STMT_INSERT_JOB: &str = "insert_job";
pub const STMT_UPDATE_JOB: &str = "update_job";
pub const STMT_UPDATE_JOB_QUICK: &str = "update_job_quick";
pub const STMT_UPDATE_JOB_ATTRSONLY: &str = "update_job_attrsonly";
pub const STMT_SELECT_JOB: &str = "select_job";
pub const STMT_DELETE_JOB: &str = "delete_job";
pub const STMT_FIND_JOBS_ORDBY_QRANK: &str = "find_jobs_ordby_qrank";

pub const STMT_INSERT_JOBSCR: &str = "insert_jobscr";
pub const STMT_SELECT_JOBSCR: &str = "select_jobscr";
pub const STMT_DELETE_JOBSCR: &str = "delete_jobscr";

pub const STMT_INSERT_RESV: &str = "insert_resv";
pub const STMT_UPDATE_RESV: &str = "update_resv";
pub const STMT_UPDATE_RESV_QUICK: &str = "update_resv_quick";
pub const STMT_SELECT_RESV: &str = "select_resv";
pub const STMT_DELETE_RESV: &str = "delete_resv";
pub const STMT_FINDRESVS_ORDBY_CREATTM: &str = "findresvs_ordby_creattm";

pub const STMT_INSERT_QUE: &str = "insert_que";
pub const STMT_UPDATE_QUE: &str = "update_que";
pub const STMT_SELECT_QUE: &str = "select_que";
pub const STMT_DELETE_QUE: &str = "delete_que";
pub const STMT_FIND_QUES_ORDBY_CREATTM: &str = "find_ques_ordby_creattm";

pub const STMT_INSERT_NODE: &str = "insert_node";
pub const STMT_UPDATE_NODE: &str = "update_node";
pub const STMT_SELECT_NODE: &str = "select_node";
pub const STMT_DELETE_NODE: &str = "delete_node";
pub const STMT_FIND_NODES_ORDBY_CREATTM: &str = "find_nodes_ordby_creattm";
pub const STMT_FIND_NODES_ORDBY_INDEX: &str = "find_nodes_ordby_index";

pub const STMT_INSERT_SVR: &str = "insert_svr";
pub const STMT_UPDATE_SVR: &str = "update_svr";
pub const STMT_SELECT_SVR: &str = "select_svr";
pub const STMT_SELECT_DBVER: &str = "select_dbver";
pub const STMT_SELECT_NEXT_SEQID: &str = "select_nextseqid";

pub const STMT_INSERT_SCHED: &str = "insert_sched";
pub const STMT_UPDATE_SCHED: &str = "update_sched";
pub const STMT_SELECT_SCHED: &str = "select_sched";
pub const STMT_SELECT_SCHED_ALL: &str = "select_sched_all";
pub const STMT_DELETE_SCHED: &str = "delete_sched";

pub const STMT_SELECT_MOMINFO_TIME: &str = "select_mominfo_time";
pub const STMT_UPSERT_MOMINFO_TIME: &str = "upsert_mominfo_time";

/// SQL for a named statement. Panics on an unknown name: the set is
/// closed at compile time and a miss is a programming error.
pub fn sql(name: &str) -> &'static str {
    match name {
        "insert_job" => {
            "INSERT INTO pbs_job (ji_jobid, ji_state, ji_substate, ji_svrflags, ji_queue, \
             ji_destin, ji_exuid, ji_exgid, ji_stime, ji_exitstat, ji_momaddr, ji_momport, \
             ji_qrank, ji_sjindex, ji_reruncnt, ji_jsversion, attributes) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)"
        }
        "update_job" => {
            "UPDATE pbs_job SET ji_state=$2, ji_substate=$3, ji_svrflags=$4, ji_queue=$5, \
             ji_destin=$6, ji_exuid=$7, ji_exgid=$8, ji_stime=$9, ji_exitstat=$10, \
             ji_momaddr=$11, ji_momport=$12, ji_qrank=$13, ji_sjindex=$14, ji_reruncnt=$15, \
             ji_jsversion=$16, attributes=$17, ji_savetm=now(), changecount=changecount+1 \
             WHERE ji_jobid=$1"
        }
        "update_job_quick" => {
            "UPDATE pbs_job SET ji_state=$2, ji_substate=$3, ji_svrflags=$4, ji_queue=$5, \
             ji_exitstat=$6, ji_momaddr=$7, ji_momport=$8, ji_stime=$9, ji_reruncnt=$10, \
             ji_savetm=now(), changecount=changecount+1 WHERE ji_jobid=$1"
        }
        "update_job_attrsonly" => {
            "UPDATE pbs_job SET attributes=$2, ji_savetm=now(), changecount=changecount+1 \
             WHERE ji_jobid=$1"
        }
        "select_job" => "SELECT * FROM pbs_job WHERE ji_jobid=$1",
        "delete_job" => "DELETE FROM pbs_job WHERE ji_jobid=$1",
        "find_jobs_ordby_qrank" => "SELECT * FROM pbs_job ORDER BY ji_qrank, ji_sjindex",

        "insert_jobscr" => {
            "INSERT INTO pbs_jobscript (ji_jobid, script) VALUES ($1,$2) \
             ON CONFLICT (ji_jobid) DO UPDATE SET script=EXCLUDED.script"
        }
        "select_jobscr" => "SELECT script FROM pbs_jobscript WHERE ji_jobid=$1",
        "delete_jobscr" => "DELETE FROM pbs_jobscript WHERE ji_jobid=$1",

        "insert_resv" => {
            "INSERT INTO pbs_resv (ri_resvid, ri_state, ri_queue, ri_stime, ri_etime, attributes) \
             VALUES ($1,$2,$3,$4,$5,$6)"
        }
        "update_resv" => {
            "UPDATE pbs_resv SET ri_state=$2, ri_queue=$3, ri_stime=$4, ri_etime=$5, \
             attributes=$6, ri_savetm=now(), changecount=changecount+1 WHERE ri_resvid=$1"
        }
        "update_resv_quick" => {
            "UPDATE pbs_resv SET ri_state=$2, ri_savetm=now(), changecount=changecount+1 \
             WHERE ri_resvid=$1"
        }
        "select_resv" => "SELECT * FROM pbs_resv WHERE ri_resvid=$1",
        "delete_resv" => "DELETE FROM pbs_resv WHERE ri_resvid=$1",
        "findresvs_ordby_creattm" => "SELECT * FROM pbs_resv ORDER BY ri_creattm",

        "insert_que" => {
            "INSERT INTO pbs_queue (qu_name, qu_type, attributes) VALUES ($1,$2,$3)"
        }
        "update_que" => {
            "UPDATE pbs_queue SET qu_type=$2, attributes=$3, qu_savetm=now(), \
             changecount=changecount+1 WHERE qu_name=$1"
        }
        "select_que" => "SELECT * FROM pbs_queue WHERE qu_name=$1",
        "delete_que" => "DELETE FROM pbs_queue WHERE qu_name=$1",
        "find_ques_ordby_creattm" => "SELECT * FROM pbs_queue ORDER BY qu_creattm",

        "insert_node" => {
            "INSERT INTO pbs_node (nd_name, nd_index, nd_hostname, nd_port, nd_state, \
             nd_sharing, attributes) VALUES ($1,$2,$3,$4,$5,$6,$7)"
        }
        "update_node" => {
            "UPDATE pbs_node SET nd_index=$2, nd_hostname=$3, nd_port=$4, nd_state=$5, \
             nd_sharing=$6, attributes=$7, nd_savetm=now(), changecount=changecount+1 \
             WHERE nd_name=$1"
        }
        "select_node" => "SELECT * FROM pbs_node WHERE nd_name=$1",
        "delete_node" => "DELETE FROM pbs_node WHERE nd_name=$1",
        "find_nodes_ordby_creattm" => "SELECT * FROM pbs_node ORDER BY nd_creattm",
        "find_nodes_ordby_index" => "SELECT * FROM pbs_node ORDER BY nd_index",

        "insert_svr" => {
            "INSERT INTO pbs_server (sv_name, sv_nextseqid, attributes) VALUES ($1,$2,$3) \
             ON CONFLICT (sv_name) DO NOTHING"
        }
        "update_svr" => {
            "UPDATE pbs_server SET sv_nextseqid=$2, attributes=$3, sv_savetm=now(), \
             changecount=changecount+1 WHERE sv_name=$1"
        }
        "select_svr" => "SELECT * FROM pbs_server WHERE sv_name=$1",
        "select_dbver" => "SELECT sv_ver FROM pbs_schema_ver",
        "select_nextseqid" => {
            "UPDATE pbs_server SET sv_nextseqid=sv_nextseqid+1 WHERE sv_name=$1 \
             RETURNING sv_nextseqid-1 AS seq"
        }

        "insert_sched" => {
            "INSERT INTO pbs_sched (sc_name, attributes) VALUES ($1,$2) \
             ON CONFLICT (sc_name) DO UPDATE SET attributes=EXCLUDED.attributes"
        }
        "update_sched" => {
            "UPDATE pbs_sched SET attributes=$2, sc_savetm=now(), changecount=changecount+1 \
             WHERE sc_name=$1"
        }
        "select_sched" => "SELECT * FROM pbs_sched WHERE sc_name=$1",
        "select_sched_all" => "SELECT * FROM pbs_sched ORDER BY sc_creattm",
        "delete_sched" => "DELETE FROM pbs_sched WHERE sc_name=$1",

        "select_mominfo_time" => "SELECT mit_time FROM pbs_mominfo_time WHERE mit_name=$1",
        "upsert_mominfo_time" => {
            "INSERT INTO pbs_mominfo_time (mit_name, mit_time) VALUES ($1,$2) \
             ON CONFLICT (mit_name) DO UPDATE SET mit_time=EXCLUDED.mit_time"
        }

        other => panic!("unknown statement {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_named_statement_has_sql() {
        for name in [
            STMT_INSERT_JOB,
            STMT_UPDATE_JOB,
            STMT_UPDATE_JOB_QUICK,
            STMT_UPDATE_JOB_ATTRSONLY,
            STMT_SELECT_JOB,
            STMT_DELETE_JOB,
            STMT_FIND_JOBS_ORDBY_QRANK,
            STMT_INSERT_JOBSCR,
            STMT_SELECT_JOBSCR,
            STMT_DELETE_JOBSCR,
            STMT_INSERT_RESV,
            STMT_UPDATE_RESV,
            STMT_UPDATE_RESV_QUICK,
            STMT_SELECT_RESV,
            STMT_DELETE_RESV,
            STMT_FINDRESVS_ORDBY_CREATTM,
            STMT_INSERT_QUE,
            STMT_UPDATE_QUE,
            STMT_SELECT_QUE,
            STMT_DELETE_QUE,
            STMT_FIND_QUES_ORDBY_CREATTM,
            STMT_INSERT_NODE,
            STMT_UPDATE_NODE,
            STMT_SELECT_NODE,
            STMT_DELETE_NODE,
            STMT_FIND_NODES_ORDBY_CREATTM,
            STMT_FIND_NODES_ORDBY_INDEX,
            STMT_INSERT_SVR,
            STMT_UPDATE_SVR,
            STMT_SELECT_SVR,
            STMT_SELECT_DBVER,
            STMT_SELECT_NEXT_SEQID,
            STMT_INSERT_SCHED,
            STMT_UPDATE_SCHED,
            STMT_SELECT_SCHED,
            STMT_SELECT_SCHED_ALL,
            STMT_DELETE_SCHED,
            STMT_SELECT_MOMINFO_TIME,
            STMT_UPSERT_MOMINFO_TIME,
        ] {
            assert!(!sql(name).is_empty());
        }
    }
}
