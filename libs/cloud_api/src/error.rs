//! Transport- and application-level error taxonomy shared by the
//! connection pool, the HTTP client, and the binary RPC protocol.
//!
//! The distinction this type exists to preserve is the one drawn in §7's
//! error-handling design: network failures are either temporary (retry
//! after backoff) or permanent (drop and surface to the caller), and that
//! distinction is a property of the *application* error code the server
//! returned, not of the transport that carried it.

use thiserror::Error;

/// Application error codes the server is documented to return that mean
/// "this will never succeed, stop retrying" rather than "try again".
const PERMANENT_APPLICATION_CODES: &[i64] = &[2003, 2009, 2005, 2029, 2067, 5002];

/// The one code that means the session itself is gone, not just this call.
const RELOGIN_REQUIRED_CODE: i64 = 2000;

#[derive(Debug, Error)]
pub enum CloudApiError {
    #[error("connecting to {host} failed: {source}")]
    Connect {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("no healthy socket available within the connection pool budget")]
    PoolExhausted,

    #[error("server returned non-2xx status: {0}")]
    HttpStatus(String),

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error("application error {code}: {message}")]
    Application { code: i64, message: String },
}

impl CloudApiError {
    /// Per §7: everything is a temporary network failure worth retrying
    /// except an application error the server has documented as permanent.
    pub fn is_temporary(&self) -> bool {
        match self {
            CloudApiError::Application { code, .. } => {
                !PERMANENT_APPLICATION_CODES.contains(code)
            }
            _ => true,
        }
    }

    pub fn requires_relogin(&self) -> bool {
        matches!(self, CloudApiError::Application { code, .. } if *code == RELOGIN_REQUIRED_CODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_codes_are_not_temporary() {
        let err = CloudApiError::Application {
            code: 2005,
            message: "conflict".into(),
        };
        assert!(!err.is_temporary());
    }

    #[test]
    fn unknown_application_codes_default_temporary() {
        let err = CloudApiError::Application {
            code: 9999,
            message: "?".into(),
        };
        assert!(err.is_temporary());
    }

    #[test]
    fn relogin_code_is_detected() {
        let err = CloudApiError::Application {
            code: 2000,
            message: "login required".into(),
        };
        assert!(err.requires_relogin());
        assert!(err.is_temporary());
    }
}
