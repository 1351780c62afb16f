//! Connection to the NATS server envelopes are published to.

use crate::config::NatsDispatchOptions;
use std::path::{Path, PathBuf};
use tracing::info;

/// Server used when no URL is configured.
pub const DEFAULT_NATS_URL: &str = "localhost:4222";

/// Contents of a JSON credentials file. Exactly one method must be present.
#[derive(serde::Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Credentials {
    /// NKey seed, starting with `S`.
    pub nkey: Option<String>,
    /// Shared token.
    pub token: Option<String>,
    /// Username and password.
    pub user: Option<UserCredentials>,
}

#[derive(serde::Deserialize, Debug, Clone, PartialEq)]
pub struct UserCredentials {
    pub name: String,
    pub password: String,
}

impl Credentials {
    fn connect_options(self) -> Result<async_nats::ConnectOptions, Error> {
        match (self.nkey, self.token, self.user) {
            (Some(seed), None, None) => Ok(async_nats::ConnectOptions::with_nkey(seed)),
            (None, Some(token), None) => Ok(async_nats::ConnectOptions::with_token(token)),
            (None, None, Some(user)) => Ok(async_nats::ConnectOptions::with_user_and_password(
                user.name,
                user.password,
            )),
            (None, None, None) => Err(Error::NoCredentials),
            _ => Err(Error::AmbiguousCredentials),
        }
    }
}

/// Errors that can occur while connecting to NATS.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Error reading credentials file '{path}': {source}")]
    ReadCredentials {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Error parsing credentials file: {source}")]
    ParseCredentials {
        #[source]
        source: serde_json::Error,
    },
    #[error("Error connecting to '{url}': {source}")]
    Connect {
        url: String,
        #[source]
        source: async_nats::ConnectError,
    },
    #[error("Credentials file contains no supported credentials")]
    NoCredentials,
    #[error("Credentials file must contain exactly one of nkey, token or user")]
    AmbiguousCredentials,
}

/// Reads and parses a JSON credentials file.
pub async fn read_credentials(path: &Path) -> Result<Credentials, Error> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| Error::ReadCredentials {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&contents).map_err(|source| Error::ParseCredentials { source })
}

/// NATS connection, with a JetStream context when acknowledged publishing is on.
#[derive(Debug)]
pub struct Client {
    credentials_path: Option<PathBuf>,
    url: String,
    connection_name: Option<String>,
    use_jetstream: bool,
    /// Core connection, set on connect.
    pub client: Option<async_nats::Client>,
    /// JetStream context, set on connect when enabled.
    pub jetstream: Option<async_nats::jetstream::Context>,
}

impl Client {
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl gateway_core::client::Client for Client {
    type Error = Error;

    #[tracing::instrument(skip(self), name = "nats.connect", fields(url = %self.url))]
    async fn connect(mut self) -> Result<Self, Error> {
        let mut options = match &self.credentials_path {
            Some(path) => read_credentials(path).await?.connect_options()?,
            None => async_nats::ConnectOptions::new(),
        };
        if let Some(name) = &self.connection_name {
            options = options.name(name);
        }

        let connection = options
            .connect(self.url.as_str())
            .await
            .map_err(|source| Error::Connect {
                url: self.url.clone(),
                source,
            })?;
        info!(jetstream = self.use_jetstream, "Connected to NATS");

        if self.use_jetstream {
            self.jetstream = Some(async_nats::jetstream::new(connection.clone()));
        }
        self.client = Some(connection);
        Ok(self)
    }
}

/// Builder for unconnected NATS clients.
#[derive(Default)]
pub struct ClientBuilder {
    credentials_path: Option<PathBuf>,
    url: Option<String>,
    connection_name: Option<String>,
    use_jetstream: bool,
}

impl ClientBuilder {
    pub fn new() -> Self {
        ClientBuilder::default()
    }

    /// Starts from dispatch options.
    pub fn from_options(options: &NatsDispatchOptions) -> Self {
        ClientBuilder {
            credentials_path: options.credentials_path.clone(),
            url: options.url.clone(),
            connection_name: None,
            use_jetstream: options.jetstream,
        }
    }

    /// Sets the JSON credentials file, holding one of:
    ///
    /// ```json
    /// { "nkey": "SUAC..." }
    /// { "token": "s3cr3t" }
    /// { "user": { "name": "gateway", "password": "s3cr3t" } }
    /// ```
    pub fn credentials_path(mut self, path: PathBuf) -> Self {
        self.credentials_path = Some(path);
        self
    }

    pub fn url(mut self, url: String) -> Self {
        self.url = Some(url);
        self
    }

    /// Name the connection is reported under in server monitoring.
    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    pub fn jetstream(mut self, enabled: bool) -> Self {
        self.use_jetstream = enabled;
        self
    }

    pub fn build(self) -> Client {
        Client {
            credentials_path: self.credentials_path,
            url: self.url.unwrap_or_else(|| DEFAULT_NATS_URL.to_string()),
            connection_name: self.connection_name,
            use_jetstream: self.use_jetstream,
            client: None,
            jetstream: None,
        }
    }
}
