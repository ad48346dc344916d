// Consistent exit codes for the fieldsync CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument error
//   11 = authentication error
//   12 = change rejected or reverted by the server
//   13 = network error

use std::process;

use fieldsync_client::config::ConfigError;
use fieldsync_client::{AdapterError, CollectionError, MutationError};

/// Named exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    Auth = 11,
    Rejected = 12,
    Network = 13,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(mutation) = cause.downcast_ref::<MutationError>() {
                return Self::from_mutation(mutation);
            }
            if let Some(adapter) = cause.downcast_ref::<AdapterError>() {
                return Self::from_adapter(adapter);
            }
            if let Some(CollectionError::Failed(message)) = cause.downcast_ref::<CollectionError>() {
                return Self::from_message(message);
            }
            if let Some(ConfigError::InvalidUrl { .. }) = cause.downcast_ref::<ConfigError>() {
                return Self::Usage;
            }
        }
        Self::from_message(&format!("{err:#}"))
    }

    fn from_mutation(error: &MutationError) -> Self {
        match error {
            MutationError::Rejected { status: 401 | 403, .. } => Self::Auth,
            MutationError::Rejected { .. } | MutationError::Lost { .. } => Self::Rejected,
            MutationError::Network(adapter) => Self::from_adapter(adapter),
            MutationError::NotFound { .. }
            | MutationError::AlreadyExists { .. }
            | MutationError::InvalidPatch(_)
            | MutationError::Unsupported { .. } => Self::Usage,
            MutationError::InFlight { .. } | MutationError::Closed => Self::Error,
        }
    }

    fn from_adapter(error: &AdapterError) -> Self {
        match error {
            AdapterError::Rejected { status: 401 | 403, .. } => Self::Auth,
            AdapterError::Rejected { .. } => Self::Rejected,
            AdapterError::Transport(_) | AdapterError::Server { .. } => Self::Network,
            AdapterError::Decode(_) => Self::Error,
        }
    }

    fn from_message(message: &str) -> Self {
        if message.contains("(401)") || message.contains("(403)") {
            return Self::Auth;
        }
        if message.contains("network error") || message.contains("shape request failed") {
            return Self::Network;
        }
        Self::Error
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_common::protocol::mutation::Txid;

    #[test]
    fn exit_code_values() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::Error.code(), 1);
        assert_eq!(ExitCode::Usage.code(), 2);
        assert_eq!(ExitCode::Auth.code(), 11);
        assert_eq!(ExitCode::Rejected.code(), 12);
        assert_eq!(ExitCode::Network.code(), 13);
    }

    #[test]
    fn rejected_and_lost_mutations() {
        let rejected = anyhow::Error::new(MutationError::Rejected {
            status: 422,
            detail: "not allowed".into(),
        });
        assert_eq!(ExitCode::from_error(&rejected), ExitCode::Rejected);

        let lost = anyhow::Error::new(MutationError::Lost { key: "E1".into(), txid: Txid(9) })
            .context("failed to set status");
        assert_eq!(ExitCode::from_error(&lost), ExitCode::Rejected);
    }

    #[test]
    fn auth_rejections() {
        let err = anyhow::Error::new(MutationError::Rejected { status: 401, detail: "expired".into() });
        assert_eq!(ExitCode::from_error(&err), ExitCode::Auth);

        let err = anyhow::Error::new(CollectionError::Failed(
            "shape subscription rejected (403): forbidden".into(),
        ));
        assert_eq!(ExitCode::from_error(&err), ExitCode::Auth);
    }

    #[test]
    fn network_failures() {
        let err = anyhow::Error::new(MutationError::Network(AdapterError::Transport(
            "connection refused".into(),
        )));
        assert_eq!(ExitCode::from_error(&err), ExitCode::Network);

        let err = anyhow::Error::new(AdapterError::Server { status: 503, detail: "busy".into() });
        assert_eq!(ExitCode::from_error(&err), ExitCode::Network);
    }

    #[test]
    fn usage_errors() {
        let err = anyhow::Error::new(MutationError::NotFound { key: "E9".into() });
        assert_eq!(ExitCode::from_error(&err), ExitCode::Usage);

        let err = anyhow::Error::new(ConfigError::InvalidUrl {
            value: "ftp://x".into(),
            reason: "must use https".into(),
        });
        assert_eq!(ExitCode::from_error(&err), ExitCode::Usage);
    }

    #[test]
    fn generic_is_error() {
        let err = anyhow::anyhow!("something went wrong");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Error);
    }
}
