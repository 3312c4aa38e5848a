//! Transfer session negotiation and the secret codec bound to it.
//!
//! Only the `plain` algorithm is negotiated: payloads cross the bus
//! unencrypted, inside an already-authenticated session bus connection.

use std::sync::Arc;

use lockbox_core::{Error, Result, SecretValue};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::transport::{SecretTransport, WireSecret};

pub const ALGORITHM_PLAIN: &str = "plain";

/// Supported session algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAlgorithm {
    Plain,
}

impl SessionAlgorithm {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            ALGORITHM_PLAIN => Ok(Self::Plain),
            other => Err(Error::Other(anyhow::anyhow!(
                "session algorithm {other:?} is not supported"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => ALGORITHM_PLAIN,
        }
    }
}

/// An established session.
#[derive(Debug)]
pub struct Session {
    path: String,
    algorithm: SessionAlgorithm,
}

impl Session {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn algorithm(&self) -> SessionAlgorithm {
        self.algorithm
    }

    /// Wrap a plaintext secret for the wire.
    pub fn encode(&self, secret: &SecretValue) -> WireSecret {
        match self.algorithm {
            SessionAlgorithm::Plain => WireSecret {
                session: self.path.clone(),
                parameters: Vec::new(),
                value: Zeroizing::new(secret.get().to_vec()),
                content_type: secret.content_type().to_string(),
            },
        }
    }

    /// Unwrap a wire secret produced for this session.
    pub fn decode(&self, wire: WireSecret) -> Result<SecretValue> {
        if wire.session != self.path {
            return Err(Error::Protocol(format!(
                "secret belongs to session {}, expected {}",
                wire.session, self.path
            )));
        }
        match self.algorithm {
            SessionAlgorithm::Plain => {
                if !wire.parameters.is_empty() {
                    return Err(Error::Protocol(
                        "plain secret carries unexpected parameters".to_string(),
                    ));
                }
                Ok(SecretValue::from_zeroizing(wire.value, wire.content_type))
            }
        }
    }
}

/// Holds the at-most-one session of a service handle.  Concurrent callers of
/// [`SessionSlot::ensure`] share a single negotiation.
pub(crate) struct SessionSlot {
    algorithm: String,
    cell: OnceCell<Arc<Session>>,
}

impl SessionSlot {
    pub(crate) fn new(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            cell: OnceCell::new(),
        }
    }

    pub(crate) fn get(&self) -> Option<Arc<Session>> {
        self.cell.get().cloned()
    }

    pub(crate) async fn ensure(&self, transport: &dyn SecretTransport) -> Result<Arc<Session>> {
        let session = self
            .cell
            .get_or_try_init(|| async {
                let algorithm = SessionAlgorithm::parse(&self.algorithm)?;
                debug!(algorithm = algorithm.as_str(), "negotiating session");
                let (output, path) = transport.open_session(algorithm.as_str(), &[]).await?;
                if !output.is_empty() {
                    return Err(Error::Protocol(
                        "plain session returned algorithm output".to_string(),
                    ));
                }
                info!(session = %path, algorithm = algorithm.as_str(), "session established");
                Ok(Arc::new(Session { path, algorithm }))
            })
            .await?;
        Ok(Arc::clone(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockService;

    #[test]
    fn unsupported_algorithm_rejected() {
        assert!(SessionAlgorithm::parse("plain").is_ok());
        assert!(SessionAlgorithm::parse("dh-ietf1024-sha256-aes128-cbc-pkcs7").is_err());
    }

    #[test]
    fn plain_codec_round_trips_and_checks_session() {
        let session = Session {
            path: "/org/freedesktop/secrets/session/s1".to_string(),
            algorithm: SessionAlgorithm::Plain,
        };
        let secret = SecretValue::new_text("p1");
        let wire = session.encode(&secret);
        assert_eq!(wire.session, session.path());
        assert_eq!(session.decode(wire.clone()).unwrap(), secret);

        let mut foreign = wire;
        foreign.session = "/org/freedesktop/secrets/session/other".to_string();
        assert!(matches!(session.decode(foreign), Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn concurrent_ensure_negotiates_once() {
        let mock = MockService::new();
        mock.set_session_delay(std::time::Duration::from_millis(20));
        let slot = SessionSlot::new(ALGORITHM_PLAIN);

        let (a, b) = tokio::join!(slot.ensure(mock.as_ref()), slot.ensure(mock.as_ref()));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(mock.counters().open_session(), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(slot.get().unwrap().path(), a.path());
    }

    #[tokio::test]
    async fn failed_negotiation_can_be_retried() {
        let mock = MockService::new();
        mock.fail_next_open_session();
        let slot = SessionSlot::new(ALGORITHM_PLAIN);

        assert!(slot.ensure(mock.as_ref()).await.is_err());
        assert!(slot.get().is_none());
        slot.ensure(mock.as_ref()).await.unwrap();
        assert_eq!(mock.counters().open_session(), 2);
    }
}
