// HTTP long-poll transport for the shape endpoint.
//
//   GET {api}/v1/shape?table=<t>&where=project_id=<id>&offset=<o>[&handle=<h>][&live=true]&replica=full

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use fieldsync_common::protocol::mutation::ErrorBody;
use fieldsync_common::protocol::shape::{
    LogOffset, ShapeHandle, ShapeMessage, HANDLE_HEADER, OFFSET_HEADER, SHAPE_PATH,
};

use super::{ShapeBatch, ShapeRequest, ShapeResponse, ShapeTransport};
use crate::adapter::http::endpoint_url;
use crate::error::ShapeError;

pub struct HttpShapeTransport {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpShapeTransport {
    pub fn new(client: reqwest::Client, base_url: Url, auth_token: Option<String>) -> Self {
        Self { client, base_url, auth_token }
    }

    fn shape_url(&self) -> Result<Url, ShapeError> {
        let segments: Vec<&str> = SHAPE_PATH.split('/').collect();
        endpoint_url(&self.base_url, &segments).map_err(ShapeError::Protocol)
    }
}

#[async_trait]
impl ShapeTransport for HttpShapeTransport {
    async fn fetch(&self, request: &ShapeRequest) -> Result<ShapeResponse, ShapeError> {
        let offset = request.offset.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("table", request.table),
            ("where", request.where_clause.as_str()),
            ("offset", offset.as_str()),
            ("replica", "full"),
        ];
        if let Some(handle) = &request.handle {
            query.push(("handle", handle.0.as_str()));
        }
        if request.live {
            query.push(("live", "true"));
        }

        let mut builder = self.client.get(self.shape_url()?).query(&query);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .await
            .map_err(|error| ShapeError::Transient(error.to_string()))?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            debug!(table = request.table, "server requested refetch");
            return Ok(ShapeResponse::MustRefetch);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) => body.message(),
                Err(_) => text,
            };
            return Err(ShapeError::from_status(status.as_u16(), message));
        }

        let (handle, offset) = position_headers(response.headers())?;
        let body: Vec<Value> = response
            .json()
            .await
            .map_err(|error| ShapeError::Transient(format!("reading shape body: {error}")))?;
        let messages = body
            .into_iter()
            .filter_map(|message| match serde_json::from_value::<ShapeMessage>(message) {
                Ok(message) => Some(message),
                Err(error) => {
                    warn!(table = request.table, %error, "dropping unrecognized shape message");
                    None
                }
            })
            .collect();

        Ok(ShapeResponse::Batch(ShapeBatch { handle, offset, messages }))
    }
}

fn position_headers(headers: &HeaderMap) -> Result<(ShapeHandle, LogOffset), ShapeError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ShapeError::Protocol(format!("missing {name} header")))
    };
    let handle = ShapeHandle(header(HANDLE_HEADER)?.to_string());
    let offset = header(OFFSET_HEADER)?
        .parse::<LogOffset>()
        .map_err(|error| ShapeError::Protocol(error.to_string()))?;
    Ok((handle, offset))
}
