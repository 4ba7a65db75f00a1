/*!
 * Session Validation
 *
 * A connection is trusted only when the peer runs under our uid and opens
 * with a non-default session on the same protocol version. Every command
 * frame is refused until that holds.
 */

use crate::core::errors::ExecError;
use crate::core::types::{ExecResult, SessionId};
use crate::protocol::{ClientFrame, PROTOCOL_VERSION};
use nix::unistd::getuid;
use tokio::net::UnixStream;

/// Both halves of an accepted handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSession {
    pub client: SessionId,
    pub service: SessionId,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionValidator {
    expected_uid: u32,
}

impl SessionValidator {
    /// Accept peers running as the current user
    pub fn current_user() -> Self {
        Self {
            expected_uid: getuid().as_raw(),
        }
    }

    pub fn for_uid(expected_uid: u32) -> Self {
        Self { expected_uid }
    }

    pub fn expected_uid(&self) -> u32 {
        self.expected_uid
    }

    /// Kernel-reported credentials of the connecting process
    pub fn check_peer(&self, stream: &UnixStream) -> ExecResult<()> {
        let cred = stream
            .peer_cred()
            .map_err(|e| ExecError::InvalidSession(format!("peer credentials unavailable: {e}")))?;

        if cred.uid() != self.expected_uid {
            return Err(ExecError::InvalidSession(format!(
                "peer uid {} does not match {}",
                cred.uid(),
                self.expected_uid
            )));
        }
        Ok(())
    }

    /// First frame must be a `Hello` with a usable session
    pub fn check_hello(&self, frame: &ClientFrame) -> ExecResult<ServiceSession> {
        match frame {
            ClientFrame::Hello { session, version } => {
                if *version != PROTOCOL_VERSION {
                    return Err(ExecError::InvalidSession(format!(
                        "unsupported protocol version {version}"
                    )));
                }
                if session.is_default() {
                    return Err(ExecError::InvalidSession(
                        "client presented the default session".into(),
                    ));
                }
                Ok(ServiceSession {
                    client: *session,
                    service: SessionId::generate(),
                })
            }
            _ => Err(ExecError::InvalidSession(
                "expected hello before any other frame".into(),
            )),
        }
    }
}
