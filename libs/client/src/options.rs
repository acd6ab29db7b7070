//! Client connection options.

use crate::error::ClientError;
use url::Url;

/// Options for a client connection: broker endpoint and credentials.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    server_url: String,
    username: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
}

impl ClientOptions {
    /// Create options for a `tcp://host:port` broker endpoint.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            username: None,
            password: None,
            client_id: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Validate the server URL and reduce it to a dialable `host:port`.
    pub(crate) fn endpoint(&self) -> Result<String, ClientError> {
        let url = Url::parse(&self.server_url)
            .map_err(|e| ClientError::invalid_value(format!("server url: {e}")))?;

        if url.scheme() != "tcp" {
            return Err(ClientError::invalid_value(format!(
                "unsupported scheme {:?}, expected tcp",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| ClientError::invalid_value("server url has no host"))?;
        let port = url
            .port()
            .ok_or_else(|| ClientError::invalid_value("server url has no port"))?;

        Ok(format!("{host}:{port}"))
    }
}
