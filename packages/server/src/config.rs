//! Daemon configuration.
//!
//! Values come from three layers: environment variables win over the
//! `key = value` config file, which wins over built-in defaults. The
//! file path itself comes from `PBS_CONF_FILE`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use dotenvy::dotenv;

pub const DEFAULT_CONF_FILE: &str = "/etc/pbs.conf";

pub const DEFAULT_BATCH_PORT: u16 = 15001;
pub const DEFAULT_COMM_PORT: u16 = 15002;
pub const DEFAULT_MOM_PORT: u16 = 15003;
pub const DEFAULT_MANAGER_PORT: u16 = 15004;
pub const DEFAULT_DATA_PORT: u16 = 15007;

/// Server configuration, one field per recognized key.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_name: String,
    pub home: String,
    pub exec_path: String,

    pub start_server: bool,
    pub start_mom: bool,
    pub start_sched: bool,
    pub start_comm: bool,

    pub batch_service_port: u16,
    pub batch_service_port_dis: u16,
    pub mom_service_port: u16,
    pub manager_service_port: u16,
    pub data_service_port: u16,

    pub auth_method: String,
    pub encrypt_method: Option<String>,
    pub supported_auth_methods: Vec<String>,

    pub data_service_host: Option<String>,
    pub data_service_user: Option<String>,

    pub leaf_name: Option<String>,
    pub leaf_routers: Vec<String>,
    pub comm_name: Option<String>,
    pub comm_routers: Vec<String>,
    pub comm_threads: u32,
    pub comm_log_events: u32,

    pub use_compression: bool,
    pub use_mcast: bool,

    pub core_limit: Option<String>,
    pub log_highres_timestamp: bool,
    pub sched_threads: u32,

    /// Postgres connection string assembled from the data-service keys,
    /// overridable wholesale with DATABASE_URL.
    pub database_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            home: "/var/spool/pbs".to_string(),
            exec_path: "/opt/pbs".to_string(),
            start_server: true,
            start_mom: false,
            start_sched: true,
            start_comm: true,
            batch_service_port: DEFAULT_BATCH_PORT,
            batch_service_port_dis: DEFAULT_BATCH_PORT,
            mom_service_port: DEFAULT_MOM_PORT,
            manager_service_port: DEFAULT_MANAGER_PORT,
            data_service_port: DEFAULT_DATA_PORT,
            auth_method: "resvport".to_string(),
            encrypt_method: None,
            supported_auth_methods: vec!["resvport".to_string()],
            data_service_host: None,
            data_service_user: None,
            leaf_name: None,
            leaf_routers: Vec::new(),
            comm_name: None,
            comm_routers: Vec::new(),
            comm_threads: 4,
            comm_log_events: 0,
            use_compression: false,
            use_mcast: false,
            core_limit: None,
            log_highres_timestamp: false,
            sched_threads: 1,
            database_url: String::new(),
        }
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "y")
}

fn parse_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse the `key = value` file body. `#` starts a comment; blank lines
/// and unrecognized keys are skipped.
fn parse_conf_text(text: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            out.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    out
}

impl Config {
    /// Load configuration: defaults, then the conf file, then the
    /// environment on top.
    pub fn load() -> Result<Self> {
        let _ = dotenv();
        let conf_file =
            std::env::var("PBS_CONF_FILE").unwrap_or_else(|_| DEFAULT_CONF_FILE.to_string());
        let file_vals = if Path::new(&conf_file).exists() {
            let text = std::fs::read_to_string(&conf_file)
                .with_context(|| format!("reading {conf_file}"))?;
            parse_conf_text(&text)
        } else {
            HashMap::new()
        };
        let lookup = |key: &str| -> Option<String> {
            std::env::var(key).ok().or_else(|| file_vals.get(key).cloned())
        };
        Ok(Self::from_lookup(lookup))
    }

    /// Build a config from a key lookup closure. Split out so tests can
    /// feed file text without touching the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut c = Config::default();

        if let Some(v) = lookup("PBS_SERVER") {
            c.server_name = v;
        }
        if let Some(v) = lookup("PBS_HOME") {
            c.home = v;
        }
        if let Some(v) = lookup("PBS_EXEC") {
            c.exec_path = v;
        }
        if let Some(v) = lookup("PBS_START_SERVER") {
            c.start_server = parse_bool(&v);
        }
        if let Some(v) = lookup("PBS_START_MOM") {
            c.start_mom = parse_bool(&v);
        }
        if let Some(v) = lookup("PBS_START_SCHED") {
            c.start_sched = parse_bool(&v);
        }
        if let Some(v) = lookup("PBS_START_COMM") {
            c.start_comm = parse_bool(&v);
        }

        let mut port = |key: &str, slot: &mut u16| {
            if let Some(v) = lookup(key) {
                if let Ok(p) = v.parse::<u16>() {
                    *slot = p;
                }
            }
        };
        port("PBS_BATCH_SERVICE_PORT", &mut c.batch_service_port);
        port("PBS_BATCH_SERVICE_PORT_DIS", &mut c.batch_service_port_dis);
        port("PBS_MOM_SERVICE_PORT", &mut c.mom_service_port);
        port("PBS_MANAGER_SERVICE_PORT", &mut c.manager_service_port);
        port("PBS_DATA_SERVICE_PORT", &mut c.data_service_port);

        if let Some(v) = lookup("PBS_AUTH_METHOD") {
            c.auth_method = v.to_lowercase();
        }
        if let Some(v) = lookup("PBS_ENCRYPT_METHOD") {
            c.encrypt_method = Some(v.to_lowercase());
        }
        if let Some(v) = lookup("PBS_SUPPORTED_AUTH_METHODS") {
            c.supported_auth_methods = parse_list(&v.to_lowercase());
        }
        if let Some(v) = lookup("PBS_DATA_SERVICE_HOST") {
            c.data_service_host = Some(v);
        }
        if let Some(v) = lookup("PBS_DATA_SERVICE_USER") {
            c.data_service_user = Some(v);
        }
        if let Some(v) = lookup("PBS_LEAF_NAME") {
            c.leaf_name = Some(v);
        }
        if let Some(v) = lookup("PBS_LEAF_ROUTERS") {
            c.leaf_routers = parse_list(&v);
        }
        if let Some(v) = lookup("PBS_COMM_NAME") {
            c.comm_name = Some(v);
        }
        if let Some(v) = lookup("PBS_COMM_ROUTERS") {
            c.comm_routers = parse_list(&v);
        }
        if let Some(v) = lookup("PBS_COMM_THREADS") {
            if let Ok(n) = v.parse() {
                c.comm_threads = n;
            }
        }
        if let Some(v) = lookup("PBS_COMM_LOG_EVENTS") {
            if let Ok(n) = v.parse() {
                c.comm_log_events = n;
            }
        }
        if let Some(v) = lookup("PBS_USE_COMPRESSION") {
            c.use_compression = parse_bool(&v);
        }
        if let Some(v) = lookup("PBS_USE_MCAST") {
            c.use_mcast = parse_bool(&v);
        }
        if let Some(v) = lookup("PBS_CORE_LIMIT") {
            c.core_limit = Some(v);
        }
        if let Some(v) = lookup("PBS_LOG_HIGHRES_TIMESTAMP") {
            c.log_highres_timestamp = parse_bool(&v);
        }
        if let Some(v) = lookup("PBS_SCHED_THREADS") {
            if let Ok(n) = v.parse() {
                c.sched_threads = n;
            }
        }

        c.database_url = lookup("DATABASE_URL").unwrap_or_else(|| {
            let host = c.data_service_host.as_deref().unwrap_or("localhost");
            let user = c.data_service_user.as_deref().unwrap_or("pbsdata");
            format!(
                "postgres://{user}@{host}:{}/pbs_datastore",
                c.data_service_port
            )
        });

        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_text(text: &str) -> Config {
        let vals = parse_conf_text(text);
        Config::from_lookup(|k| vals.get(k).cloned())
    }

    #[test]
    fn defaults_fill_every_port() {
        let c = from_text("");
        assert_eq!(c.batch_service_port, 15001);
        assert_eq!(c.mom_service_port, 15003);
        assert_eq!(c.manager_service_port, 15004);
        assert_eq!(c.data_service_port, 15007);
    }

    #[test]
    fn file_values_override_defaults() {
        let c = from_text(
            "PBS_SERVER = head01\n\
             PBS_BATCH_SERVICE_PORT = 16001\n\
             PBS_START_MOM = 1\n\
             # a comment line\n\
             PBS_LEAF_ROUTERS = comm01:17001, comm02:17001\n",
        );
        assert_eq!(c.server_name, "head01");
        assert_eq!(c.batch_service_port, 16001);
        assert!(c.start_mom);
        assert_eq!(c.leaf_routers, vec!["comm01:17001", "comm02:17001"]);
    }

    #[test]
    fn env_wins_over_file() {
        let vals = parse_conf_text("PBS_SERVER = fromfile\n");
        let c = Config::from_lookup(|k| {
            if k == "PBS_SERVER" {
                Some("fromenv".to_string())
            } else {
                vals.get(k).cloned()
            }
        });
        assert_eq!(c.server_name, "fromenv");
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let vals = parse_conf_text("# leading comment\n\nPBS_HOME=/pbs # trailing\n");
        assert_eq!(vals.get("PBS_HOME").map(String::as_str), Some("/pbs"));
        assert_eq!(vals.len(), 1);
    }

    #[test]
    fn database_url_assembles_from_data_service_keys() {
        let c = from_text("PBS_DATA_SERVICE_HOST=db01\nPBS_DATA_SERVICE_USER=pbsdata\n");
        assert_eq!(c.database_url, "postgres://pbsdata@db01:15007/pbs_datastore");
    }
}
