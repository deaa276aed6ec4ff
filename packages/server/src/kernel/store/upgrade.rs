//! On-load upgrade of pre-current job records.
//!
//! Records written before version 21 carried fixed-width id fields
//! padded with trailing spaces and kept the extend blob in its own
//! slot. The load path normalizes such rows in place; the caller
//! re-saves when anything changed.

use super::job_store::DbJobRow;

pub const JOB_RECORD_VERSION: i32 = 21;

pub fn upgrade_job_row(row: &mut DbJobRow) -> bool {
    if row.ji_jsversion >= JOB_RECORD_VERSION {
        return false;
    }
    // strip the fixed-width padding old writers left behind
    trim_in_place(&mut row.ji_jobid);
    trim_in_place(&mut row.ji_queue);
    trim_in_place(&mut row.ji_destin);

    // relocate the extend blob into the attribute array proper
    for kv in row.attributes.chunks_exact_mut(2) {
        if kv[0] == "jobextend." {
            kv[0] = "extend.".to_string();
        }
    }

    row.ji_jsversion = JOB_RECORD_VERSION;
    true
}

fn trim_in_place(s: &mut String) {
    let trimmed = s.trim_end();
    if trimmed.len() != s.len() {
        *s = trimmed.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn old_row() -> DbJobRow {
        DbJobRow {
            ji_jobid: "1.host   ".into(),
            ji_state: 1,
            ji_substate: 10,
            ji_svrflags: 0,
            ji_queue: "workq  ".into(),
            ji_destin: "workq  ".into(),
            ji_exuid: 0,
            ji_exgid: 0,
            ji_stime: None,
            ji_exitstat: None,
            ji_momaddr: None,
            ji_momport: 0,
            ji_qrank: 1,
            ji_sjindex: -1,
            ji_reruncnt: 0,
            ji_jsversion: 20,
            ji_creattm: Utc::now(),
            ji_savetm: Utc::now(),
            changecount: 0,
            attributes: vec!["jobextend.".into(), "3.x=y".into()],
        }
    }

    #[test]
    fn pre_21_rows_are_normalized() {
        let mut row = old_row();
        assert!(upgrade_job_row(&mut row));
        assert_eq!(row.ji_jobid, "1.host");
        assert_eq!(row.ji_queue, "workq");
        assert_eq!(row.attributes[0], "extend.");
        assert_eq!(row.ji_jsversion, JOB_RECORD_VERSION);
    }

    #[test]
    fn current_rows_pass_through() {
        let mut row = old_row();
        row.ji_jsversion = JOB_RECORD_VERSION;
        assert!(!upgrade_job_row(&mut row));
        assert_eq!(row.ji_jobid, "1.host   ");
    }
}
