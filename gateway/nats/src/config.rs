//! Configuration for dispatching envelopes over NATS.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// NATS dispatch settings.
#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct NatsDispatchOptions {
    /// Server URL, defaults to [`DEFAULT_NATS_URL`](crate::client::DEFAULT_NATS_URL).
    pub url: Option<String>,
    /// JSON credentials file. Connects anonymously when unset.
    pub credentials_path: Option<PathBuf>,
    /// Subject every envelope is published to. Defaults to the envelope's source host.
    pub subject: Option<String>,
    /// Publish through JetStream and wait for the server acknowledgement.
    #[serde(default)]
    pub jetstream: bool,
}
