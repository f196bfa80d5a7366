use crate::fetch_client::FetchClientError;
use crate::pipeline::types::{FetchError, FetchErrorKind};

use super::extract::ExtractError;

pub fn map_client_error(error: FetchClientError) -> FetchError {
    match &error {
        FetchClientError::Transport { source, .. } => {
            tracing::debug!(
                event = "fetch_transport_diagnostics",
                is_timeout = source.is_timeout(),
                is_connect = source.is_connect(),
                is_body = source.is_body(),
                is_request = source.is_request(),
                "captured reqwest diagnostics"
            );
            FetchError::new(FetchErrorKind::Network, error.to_string())
        }
        FetchClientError::Status { .. }
        | FetchClientError::Incomplete { .. }
        | FetchClientError::Cancelled => {
            FetchError::new(FetchErrorKind::Network, error.to_string())
        }
        FetchClientError::ClientBuild(_) => {
            FetchError::new(FetchErrorKind::Other, error.to_string())
        }
    }
}

pub fn map_extract_error(error: ExtractError) -> FetchError {
    match error {
        ExtractError::Pattern(message) => FetchError::new(FetchErrorKind::Other, message),
        other => FetchError::new(FetchErrorKind::MalformedResponse, other.to_string()),
    }
}
