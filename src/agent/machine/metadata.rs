use serde_json::Value;
use tracing::debug;

use crate::{agent::machine::api::ApiClient, error::MetadataError};

/// Replaces the VM's metadata document with `payload`, verbatim. The guest reads it from the
/// metadata service on its `eth0` link.
pub async fn push(client: &ApiClient, payload: &Value) -> Result<(), MetadataError> {
    client
        .put("/mmds", payload)
        .await
        .map_err(|source| MetadataError {
            socket: client.socket_path().to_path_buf(),
            source,
        })?;

    debug!("pushed metadata to {}", client.socket_path().display());
    Ok(())
}
