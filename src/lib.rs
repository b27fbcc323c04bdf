pub mod cache;
pub mod discovery;
pub mod github;
pub mod logger;

use crate::github::GithubError;

/// Decode a JSON value into `T`, reporting the path of the offending
/// field on mismatch.
pub fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, GithubError> {
    serde_path_to_error::deserialize(value)
        .map_err(|e| GithubError::api(format!("failed to decode at {}: {}", e.path(), e.inner())))
}
