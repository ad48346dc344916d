// HTTP implementation of the Network Adapter over the REST mutation endpoints.
//
//   create  POST   {api}/{table}?project_id=<id>                 body: row
//   update  PATCH  {api}/{table}?project_id=<id>&<key_field>=<k>  body: change set
//   delete  DELETE {api}/{table}?project_id=<id>&<key_field>=<k>
//   read    GET    {api}/{table}/{key}?project_id=<id>
//   seed    GET    {api}/projects/{id}/{table}

use std::marker::PhantomData;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};
use url::Url;

use fieldsync_common::protocol::mutation::{ErrorBody, MutationResponse, Txid};
use fieldsync_common::types::Row;

use super::{Mutation, NetworkAdapter};
use crate::error::AdapterError;

/// Network Adapter for one table of one project.
pub struct HttpNetworkAdapter<R> {
    client: reqwest::Client,
    base_url: Url,
    project_id: i64,
    auth_token: Option<String>,
    _row: PhantomData<fn() -> R>,
}

impl<R: Row> HttpNetworkAdapter<R> {
    pub fn new(
        client: reqwest::Client,
        base_url: Url,
        project_id: i64,
        auth_token: Option<String>,
    ) -> Self {
        Self { client, base_url, project_id, auth_token, _row: PhantomData }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, AdapterError> {
        endpoint_url(&self.base_url, segments)
            .map_err(|error| AdapterError::Transport(format!("invalid endpoint: {error}")))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl<R: Row> NetworkAdapter<R> for HttpNetworkAdapter<R> {
    async fn submit(&self, mutation: &Mutation<R>) -> Result<Txid, AdapterError> {
        let span = info_span!(
            "fieldsync.adapter.submit",
            table = R::TABLE,
            project_id = self.project_id,
            key = %mutation.key(),
            kind = %mutation.kind()
        );
        async {
            let url = self.endpoint(&[R::TABLE])?;
            let project = self.project_id.to_string();
            let request = match mutation {
                Mutation::Insert(row) => {
                    self.client.post(url).query(&[("project_id", project.as_str())]).json(row)
                }
                Mutation::Update { key, changes } => self
                    .client
                    .patch(url)
                    .query(&[("project_id", project.as_str()), (R::KEY_FIELD, key.as_str())])
                    .json(changes),
                Mutation::Delete { key } => self
                    .client
                    .delete(url)
                    .query(&[("project_id", project.as_str()), (R::KEY_FIELD, key.as_str())]),
            };

            let response = self.authorize(request).send().await.map_err(transport_error)?;
            let body: MutationResponse<Value> = read_json(response).await?;
            debug!(txid = %body.txid, "mutation accepted");
            Ok(body.txid)
        }
        .instrument(span)
        .await
    }

    async fn fetch_row(&self, key: &str) -> Result<Option<R>, AdapterError> {
        let span = info_span!(
            "fieldsync.adapter.fetch_row",
            table = R::TABLE,
            project_id = self.project_id,
            key = %key
        );
        async {
            let url = self.endpoint(&[R::TABLE, key])?;
            let project = self.project_id.to_string();
            let request = self.client.get(url).query(&[("project_id", project.as_str())]);
            let response = self.authorize(request).send().await.map_err(transport_error)?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            read_json(response).await.map(Some)
        }
        .instrument(span)
        .await
    }

    async fn fetch_snapshot(&self) -> Result<Vec<R>, AdapterError> {
        let span = info_span!(
            "fieldsync.adapter.fetch_snapshot",
            table = R::TABLE,
            project_id = self.project_id
        );
        async {
            let project = self.project_id.to_string();
            let url = self.endpoint(&["projects", project.as_str(), R::TABLE])?;
            let response =
                self.authorize(self.client.get(url)).send().await.map_err(transport_error)?;
            let records: Vec<Value> = read_json(response).await?;
            Ok(decode_records(records))
        }
        .instrument(span)
        .await
    }
}

/// Build `{base}/{segments...}` with each segment percent-encoded.
pub(crate) fn endpoint_url(base: &Url, segments: &[&str]) -> Result<Url, String> {
    let mut url = base.clone();
    {
        let mut path =
            url.path_segments_mut().map_err(|()| format!("`{base}` cannot be a base URL"))?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

/// Decode rows one by one; a malformed record is dropped, not the batch.
pub(crate) fn decode_records<R: Row>(records: Vec<Value>) -> Vec<R> {
    records
        .into_iter()
        .filter_map(|record| match serde_json::from_value::<R>(record) {
            Ok(row) => Some(row),
            Err(error) => {
                warn!(table = R::TABLE, %error, "dropping malformed record");
                None
            }
        })
        .collect()
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, AdapterError> {
    let status = response.status();
    if !status.is_success() {
        return Err(error_from_response(status, response).await);
    }
    response.json::<T>().await.map_err(|error| AdapterError::Decode(error.to_string()))
}

async fn error_from_response(status: StatusCode, response: Response) -> AdapterError {
    let text = response.text().await.unwrap_or_default();
    let detail = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => body.message(),
        Err(_) if text.trim().is_empty() => {
            status.canonical_reason().unwrap_or("request failed").to_string()
        }
        Err(_) => text,
    };
    AdapterError::from_status(status.as_u16(), detail)
}

fn transport_error(error: reqwest::Error) -> AdapterError {
    AdapterError::Transport(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_common::types::{Entity, EntityStatus};
    use serde_json::json;

    #[test]
    fn endpoint_url_appends_encoded_segments() {
        let base = Url::parse("https://api.example.org/api/").unwrap();
        let url = endpoint_url(&base, &["odk_entities", "a b/c"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.org/api/odk_entities/a%20b%2Fc");

        let no_slash = Url::parse("https://api.example.org/api").unwrap();
        let url = endpoint_url(&no_slash, &["projects", "7", "task_events"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.org/api/projects/7/task_events");
    }

    #[test]
    fn decode_records_drops_only_malformed_rows() {
        let good = json!({
            "entity_id": "E1",
            "status": "READY",
            "project_id": 7,
            "task_id": 1,
            "osm_id": 5,
        });
        let bad = json!({"entity_id": "E2", "status": "NOT_A_STATUS"});
        let rows: Vec<Entity> = decode_records(vec![good, bad]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_id, "E1");
        assert_eq!(rows[0].status, EntityStatus::Ready);
    }
}
