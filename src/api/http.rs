//! HTTP implementation of the record API over the service's RPC endpoints.
//!
//! Raw transport failures are classified into the error taxonomy here, once;
//! callers never see a reqwest error or a status code.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use super::{CreatedRecord, RecordApi};
use crate::cache::FilterSet;
use crate::error::{classify_status, ApiError};
use crate::records::{Entry, EntryPage, EntryPatch, Payload, Privacy};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Record API client over HTTP.
#[derive(Clone)]
pub struct HttpRecordApi {
  http: reqwest::Client,
  base: Url,
  token: Option<String>,
}

// Wire types. The RPC surface is JSON throughout; entries reuse the domain
// serialization directly.

#[derive(Debug, Deserialize)]
struct ListResponse {
  entries: Vec<Entry>,
  cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
  id: String,
  uri: String,
  revision: String,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
  author: &'a str,
  privacy: Privacy,
  payload: &'a Payload,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
  author: &'a str,
  rkey: &'a str,
  expected_revision: &'a str,
  patch: &'a EntryPatch,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
  author: &'a str,
  rkey: &'a str,
  expected_revision: Option<&'a str>,
}

impl HttpRecordApi {
  pub fn new(base: Url, token: Option<String>) -> Result<Self, ApiError> {
    let http = reqwest::Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .build()
      .map_err(|e| ApiError::network(format!("failed to build http client: {}", e)))?;

    Ok(Self { http, base, token })
  }

  fn endpoint(&self, method: &str) -> Result<Url, ApiError> {
    self
      .base
      .join(&format!("rpc/{}", method))
      .map_err(|e| ApiError::validation(format!("bad endpoint '{}': {}", method, e)))
  }

  fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match &self.token {
      Some(token) => req.bearer_auth(token),
      None => req,
    }
  }

  /// Send a request and decode the JSON body, classifying every failure.
  async fn send<T: serde::de::DeserializeOwned>(
    &self,
    req: reqwest::RequestBuilder,
  ) -> Result<T, ApiError> {
    let response = self
      .authorize(req)
      .send()
      .await
      .map_err(classify_transport)?;

    let status = response.status();
    if !status.is_success() {
      let detail = response.text().await.unwrap_or_default();
      return Err(classify_status(status.as_u16(), detail.trim()));
    }

    response
      .json::<T>()
      .await
      .map_err(|e| ApiError::server(format!("unexpected response body: {}", e)))
  }
}

fn classify_transport(err: reqwest::Error) -> ApiError {
  if err.is_timeout() {
    ApiError::network(format!("request timed out: {}", err))
  } else {
    ApiError::network(format!("request failed: {}", err))
  }
}

#[async_trait]
impl RecordApi for HttpRecordApi {
  async fn list(
    &self,
    author: &str,
    filter: &FilterSet,
    limit: usize,
    cursor: Option<&str>,
  ) -> Result<EntryPage, ApiError> {
    let mut url = self.endpoint("entry.list")?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("author", author);
      query.append_pair("limit", &limit.to_string());
      if let Some(cursor) = cursor {
        query.append_pair("cursor", cursor);
      }
      for kind in &filter.kinds {
        query.append_pair("kind", kind.as_str());
      }
      if let Some(privacy) = filter.privacy {
        query.append_pair(
          "privacy",
          match privacy {
            Privacy::Public => "public",
            Privacy::Sensitive => "sensitive",
          },
        );
      }
      if let Some(search) = &filter.search {
        query.append_pair("q", search);
      }
    }

    let response: ListResponse = self.send(self.http.get(url)).await?;
    Ok(EntryPage {
      has_more: response.cursor.is_some(),
      items: response.entries,
      cursor: response.cursor,
    })
  }

  async fn get(&self, author: &str, rkey: &str) -> Result<Entry, ApiError> {
    let mut url = self.endpoint("entry.get")?;
    url
      .query_pairs_mut()
      .append_pair("author", author)
      .append_pair("rkey", rkey);

    self.send(self.http.get(url)).await
  }

  async fn create(
    &self,
    author: &str,
    privacy: Privacy,
    payload: &Payload,
  ) -> Result<CreatedRecord, ApiError> {
    let url = self.endpoint("entry.create")?;
    let response: CreateResponse = self
      .send(self.http.post(url).json(&CreateRequest {
        author,
        privacy,
        payload,
      }))
      .await?;

    Ok(CreatedRecord {
      id: response.id,
      uri: response.uri,
      revision: response.revision,
    })
  }

  async fn update(
    &self,
    author: &str,
    rkey: &str,
    expected_revision: &str,
    patch: &EntryPatch,
  ) -> Result<Entry, ApiError> {
    let url = self.endpoint("entry.update")?;
    self
      .send(self.http.post(url).json(&UpdateRequest {
        author,
        rkey,
        expected_revision,
        patch,
      }))
      .await
  }

  async fn delete(
    &self,
    author: &str,
    rkey: &str,
    expected_revision: Option<&str>,
  ) -> Result<(), ApiError> {
    let url = self.endpoint("entry.delete")?;
    // The delete endpoint returns an empty JSON object.
    let _: serde_json::Value = self
      .send(self.http.post(url).json(&DeleteRequest {
        author,
        rkey,
        expected_revision,
      }))
      .await?;
    Ok(())
  }
}
