//! Authenticated JSON requests against the Scaleway APIs.

use reqwest::RequestBuilder;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{ScalewayBackend, ScalewayBackendError};

const AUTH_HEADER: &str = "X-Auth-Token";

impl ScalewayBackend {
    pub(super) fn instance_url(&self, path: &str) -> String {
        format!("{}/instance/v1/zones/{}/{path}", self.base_url, self.zone)
    }

    pub(super) fn vpc_url(&self, path: &str) -> String {
        format!("{}/vpc/v2/regions/{}/{path}", self.base_url, self.region)
    }

    pub(super) fn iam_url(&self, path: &str) -> String {
        format!("{}/iam/v1alpha1/{path}", self.base_url)
    }

    pub(super) fn account_url(&self, path: &str) -> String {
        format!("{}/account/v3/{path}", self.base_url)
    }

    pub(super) async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, ScalewayBackendError> {
        self.fetch(self.http.get(url), url).await
    }

    /// `GET` with query parameters.
    pub(super) async fn list<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ScalewayBackendError> {
        self.fetch(self.http.get(url).query(query), url).await
    }

    pub(super) async fn post<T, B>(&self, url: &str, body: &B) -> Result<T, ScalewayBackendError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.fetch(self.http.post(url).json(body), url).await
    }

    pub(super) async fn patch<B>(&self, url: &str, body: &B) -> Result<(), ScalewayBackendError>
    where
        B: Serialize + ?Sized,
    {
        self.send(self.http.patch(url).json(body), url).await.map(drop)
    }

    /// Replaces a plain-text user-data entry.
    pub(super) async fn patch_text(&self, url: &str, text: &str) -> Result<(), ScalewayBackendError> {
        let request = self
            .http
            .patch(url)
            .header(CONTENT_TYPE, "text/plain")
            .body(text.to_owned());
        self.send(request, url).await.map(drop)
    }

    pub(super) async fn delete(&self, url: &str) -> Result<(), ScalewayBackendError> {
        self.send(self.http.delete(url), url).await.map(drop)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        url: &str,
    ) -> Result<T, ScalewayBackendError> {
        let body = self.send(request, url).await?;
        serde_json::from_slice(&body).map_err(|err| ScalewayBackendError::Decode {
            url: url.to_owned(),
            message: err.to_string(),
        })
    }

    async fn send(
        &self,
        request: RequestBuilder,
        url: &str,
    ) -> Result<Vec<u8>, ScalewayBackendError> {
        let transport = |err: reqwest::Error| ScalewayBackendError::Transport {
            url: url.to_owned(),
            message: err.to_string(),
        };
        let response = request
            .header(AUTH_HEADER, &self.secret_key)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport)?;
        debug!(url, status = status.as_u16(), "scaleway response");

        if status.is_success() {
            Ok(body.to_vec())
        } else {
            Err(ScalewayBackendError::from_response(status.as_u16(), &body))
        }
    }
}
