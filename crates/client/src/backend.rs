// Backend: builds the network collaborators for a project's collections.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use fieldsync_common::types::{Entity, TaskEvent};

use crate::adapter::http::HttpNetworkAdapter;
use crate::adapter::NetworkAdapter;
use crate::config::{auth_token_from_env, ClientConfig, ConfigError};
use crate::shape::http::HttpShapeTransport;
use crate::shape::ShapeTransport;

/// Source of adapters and shape transports, one set per project.
pub trait Backend: Send + Sync {
    fn entity_adapter(&self, project_id: i64) -> Arc<dyn NetworkAdapter<Entity>>;
    fn task_event_adapter(&self, project_id: i64) -> Arc<dyn NetworkAdapter<TaskEvent>>;
    fn shape_transport(&self) -> Arc<dyn ShapeTransport>;
}

/// HTTP backend sharing one connection pool across every collection.
pub struct HttpBackend {
    client: reqwest::Client,
    api_url: Url,
    auth_token: Option<String>,
}

impl HttpBackend {
    pub fn new(api_url: Url, auth_token: Option<String>, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("fieldsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, api_url, auth_token })
    }

    /// Build from config, taking the token from `FIELDSYNC_TOKEN`.
    pub fn from_config(config: &ClientConfig) -> Result<Self, BackendError> {
        let api_url = config.api_url()?;
        let timeout = Duration::from_millis(config.sync.request_timeout_ms);
        Self::new(api_url, auth_token_from_env(), timeout).map_err(BackendError::Client)
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }
}

impl Backend for HttpBackend {
    fn entity_adapter(&self, project_id: i64) -> Arc<dyn NetworkAdapter<Entity>> {
        Arc::new(HttpNetworkAdapter::new(
            self.client.clone(),
            self.api_url.clone(),
            project_id,
            self.auth_token.clone(),
        ))
    }

    fn task_event_adapter(&self, project_id: i64) -> Arc<dyn NetworkAdapter<TaskEvent>> {
        Arc::new(HttpNetworkAdapter::new(
            self.client.clone(),
            self.api_url.clone(),
            project_id,
            self.auth_token.clone(),
        ))
    }

    fn shape_transport(&self) -> Arc<dyn ShapeTransport> {
        Arc::new(HttpShapeTransport::new(
            self.client.clone(),
            self.api_url.clone(),
            self.auth_token.clone(),
        ))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
}
