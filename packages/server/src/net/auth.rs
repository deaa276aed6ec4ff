//! The authentication handshake.
//!
//! The first message on a fresh stream must be Authenticate; the
//! dispatcher refuses anything else until the handshake completes.
//! `resvport` trusts the kernel's privilege check on the peer's source
//! port; external methods exchange credential blobs through follow-on
//! Cred messages against a pluggable validator.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::conn::{authen, Connection};
use crate::common::{BatchError, Result};

/// Highest port number the reserved range covers.
pub const RESERVED_PORT_MAX: u16 = 1023;

/// Identity a validator derives from a credential blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredIdentity {
    pub principal: String,
}

/// Pluggable external auth method. The core only consumes this seam;
/// concrete methods (munge, gss, tls) live outside and may talk to a
/// local credential daemon, hence async.
#[async_trait]
pub trait CredValidator: Send + Sync {
    fn method(&self) -> &str;
    async fn validate(&self, user: &str, blob: &[u8]) -> Result<CredIdentity>;
}

/// Outcome of a completed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthOutcome {
    pub authenticated: bool,
    pub privileged: bool,
}

/// What the dispatcher should do after an Authenticate request.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthProgress {
    Done(AuthOutcome),
    /// External method accepted; Cred messages must follow.
    NeedCred { method: String },
}

/// Handle the Authenticate request proper.
pub fn start_handshake(
    conn: &Connection,
    owner: u64,
    supported: &[String],
    method: &str,
    client_port: u16,
) -> Result<AuthProgress> {
    let method = method.to_lowercase();
    if !supported.iter().any(|m| m == &method) {
        return Err(BatchError::BadCredential);
    }
    match method.as_str() {
        "resvport" => {
            // the peer's source port is the proof; the kernel only
            // grants the reserved range to privileged processes
            let (_, peer_port) = conn.peer(owner);
            if peer_port > RESERVED_PORT_MAX || client_port > RESERVED_PORT_MAX {
                return Err(BatchError::BadCredential);
            }
            conn.authen_set(owner, authen::AUTHENTICATED | authen::FROM_PRIVIL);
            Ok(AuthProgress::Done(AuthOutcome {
                authenticated: true,
                privileged: true,
            }))
        }
        _ => Ok(AuthProgress::NeedCred { method }),
    }
}

/// Handle a follow-on Cred message for an external method.
pub async fn handle_cred(
    conn: &Connection,
    owner: u64,
    validators: &[Arc<dyn CredValidator>],
    method: &str,
    user: &str,
    blob: &[u8],
    service_principal: &str,
) -> Result<AuthOutcome> {
    let validator = validators
        .iter()
        .find(|v| v.method() == method)
        .ok_or(BatchError::BadCredential)?;
    let identity = validator.validate(user, blob).await?;
    let privileged = identity.principal == service_principal;
    let mut bits = authen::AUTHENTICATED;
    if privileged {
        bits |= authen::FROM_PRIVIL;
    }
    conn.authen_set(owner, bits);
    conn.set_username(owner, user);
    Ok(AuthOutcome {
        authenticated: true,
        privileged,
    })
}

/// Shared-secret validator: the blob is the hex SHA-256 of
/// `user:secret`. Stands in for an external method in tests and
/// single-host deployments.
pub struct SharedSecretValidator {
    method: String,
    secret: Vec<u8>,
}

impl SharedSecretValidator {
    pub fn new(method: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            method: method.into(),
            secret: secret.into(),
        }
    }

    pub fn credential_for(&self, user: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(user.as_bytes());
        hasher.update(b":");
        hasher.update(&self.secret);
        hex::encode(hasher.finalize()).into_bytes()
    }
}

#[async_trait]
impl CredValidator for SharedSecretValidator {
    fn method(&self) -> &str {
        &self.method
    }

    async fn validate(&self, user: &str, blob: &[u8]) -> Result<CredIdentity> {
        if self.credential_for(user) == blob {
            Ok(CredIdentity {
                principal: user.to_string(),
            })
        } else {
            Err(BatchError::BadCredential)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::conn::ConnTable;
    use std::net::{IpAddr, Ipv4Addr};

    fn conn_with_port(port: u16) -> std::sync::Arc<Connection> {
        let table = ConnTable::new();
        table.add(IpAddr::V4(Ipv4Addr::LOCALHOST), port).unwrap()
    }

    fn supported() -> Vec<String> {
        vec!["resvport".to_string(), "munge".to_string()]
    }

    #[test]
    fn resvport_accepts_low_ports() {
        let conn = conn_with_port(1022);
        let progress = start_handshake(&conn, 1, &supported(), "resvport", 1022).unwrap();
        assert_eq!(
            progress,
            AuthProgress::Done(AuthOutcome {
                authenticated: true,
                privileged: true
            })
        );
        assert!(conn.authen_has(1, authen::AUTHENTICATED | authen::FROM_PRIVIL));
    }

    #[test]
    fn resvport_rejects_high_ports() {
        let conn = conn_with_port(40000);
        assert!(matches!(
            start_handshake(&conn, 1, &supported(), "resvport", 40000),
            Err(BatchError::BadCredential)
        ));
    }

    #[test]
    fn unsupported_method_is_refused() {
        let conn = conn_with_port(1022);
        assert!(matches!(
            start_handshake(&conn, 1, &supported(), "kerberos5", 1022),
            Err(BatchError::BadCredential)
        ));
    }

    #[test]
    fn external_method_requires_cred_round() {
        let conn = conn_with_port(40000);
        let progress = start_handshake(&conn, 1, &supported(), "munge", 40000).unwrap();
        assert_eq!(
            progress,
            AuthProgress::NeedCred {
                method: "munge".into()
            }
        );
        assert!(!conn.authen_has(1, authen::AUTHENTICATED));
    }

    #[tokio::test]
    async fn cred_validation_sets_flags_and_privilege() {
        let conn = conn_with_port(40000);
        let validator = Arc::new(SharedSecretValidator::new("munge", "s3cret"));
        let blob = validator.credential_for("pbs-service");
        let validators: Vec<Arc<dyn CredValidator>> = vec![validator];

        let outcome = handle_cred(
            &conn,
            1,
            &validators,
            "munge",
            "pbs-service",
            &blob,
            "pbs-service",
        )
        .await
        .unwrap();
        assert!(outcome.authenticated);
        assert!(outcome.privileged);
        assert!(conn.authen_has(1, authen::FROM_PRIVIL));
    }

    #[tokio::test]
    async fn bad_blob_is_rejected() {
        let conn = conn_with_port(40000);
        let validator = Arc::new(SharedSecretValidator::new("munge", "s3cret"));
        let validators: Vec<Arc<dyn CredValidator>> = vec![validator];
        assert!(matches!(
            handle_cred(&conn, 1, &validators, "munge", "alice", b"nope", "pbs-service").await,
            Err(BatchError::BadCredential)
        ));
    }
}
