//! REST control-plane client
//!
//! Speaks the backend's `{data, error}` envelope with bearer-token auth.
//! A 204 means success with no payload.

pub mod model;

use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::token::ServerToken;
use model::{FullConfig, Status};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RestError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api: {0}")]
    Api(String),

    #[error("api: empty data payload")]
    EmptyData,

    #[error("no supported data returned (http: {0})")]
    UnexpectedResponse(StatusCode),
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: Option<T>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

pub struct Client {
    base_url: Url,
    token: Option<ServerToken>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: Url, token: Option<ServerToken>) -> Result<Self, RestError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url,
            token,
            http,
        })
    }

    /// Backend host, for log lines
    pub fn remote_host(&self) -> &str {
        self.base_url.host_str().unwrap_or_default()
    }

    pub async fn pull_config(&self) -> Result<FullConfig, RestError> {
        let data: Option<FullConfig> = self
            .fetch(Method::GET, "/nxproxy/v1/config", None::<&()>)
            .await?;

        data.ok_or(RestError::EmptyData)
    }

    pub async fn push_status(&self, status: &Status) -> Result<(), RestError> {
        let _: Option<serde_json::Value> = self
            .fetch(Method::POST, "/nxproxy/v1/status", Some(status))
            .await?;

        Ok(())
    }

    /// Startup health probe
    pub async fn ping(&self) -> Result<(), RestError> {
        let _: Option<serde_json::Value> =
            self.fetch(Method::GET, "/nxproxy/v1/ping", None::<&()>).await?;

        Ok(())
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let joined = format!("{}{}", url.path().trim_end_matches('/'), path);
        url.set_path(&joined);
        url
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        payload: Option<&impl Serialize>,
    ) -> Result<Option<T>, RestError> {
        let mut req = self.http.request(method, self.endpoint(path));

        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        if let Some(payload) = payload {
            req = req.json(payload);
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let is_json = resp
            .headers()
            .get("content-type")
            .and_then(|val| val.to_str().ok())
            .map(|val| val.contains("json"))
            .unwrap_or(false);

        if is_json {
            let body: ApiResponse<T> = resp.json().await?;

            if let Some(err) = body.error {
                return Err(RestError::Api(err.message));
            }

            return match body.data {
                Some(data) => Ok(Some(data)),
                None => Err(RestError::EmptyData),
            };
        }

        Err(RestError::UnexpectedResponse(status))
    }
}
