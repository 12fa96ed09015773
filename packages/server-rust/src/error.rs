//! Error types for the relay's external boundaries.

use fwdwatch_core::Category;

use crate::config::ConfigError;

/// Failure of a Metadata Resolver lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("channel {0} is not known to the node")]
    UnknownChannel(u64),
    #[error("node {0} is not known to the node")]
    UnknownNode(String),
    #[error("resolver unavailable: {0}")]
    Unavailable(String),
}

/// Failure reading from an external event stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The transport failed; the stream cannot continue.
    #[error("transport error: {0}")]
    Transport(String),
    /// A record could not be decoded. Sources skip these where they can.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Errors returned by `Relay` lifecycle calls.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay already started")]
    AlreadyStarted,
    #[error("cannot resolve this node's identity: {0}")]
    SelfIdentity(#[source] ResolveError),
    #[error("cannot subscribe to {category} events: {source}")]
    Subscribe {
        category: Category,
        #[source]
        source: SourceError,
    },
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_error_names_category() {
        let err = RelayError::Subscribe {
            category: Category::InvoiceSettled,
            source: SourceError::Transport("connection refused".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "cannot subscribe to invoice_settled events: transport error: connection refused"
        );
    }

    #[test]
    fn config_error_converts() {
        let err: RelayError = ConfigError::EmptyPlaceholder.into();
        assert!(matches!(err, RelayError::Config(_)));
    }
}
