// SPDX-License-Identifier: MIT OR Apache-2.0
//! The HTTP/2 invocation session (C5): a long-lived TLS connection to
//! `lambda.<region>.amazonaws.com:443` that carries many concurrent
//! invocation requests.
//!
//! [`reqwest::Client`] negotiates HTTP/2 over ALPN and pools connections
//! per host internally, so one cloned `Client` handle *is* the
//! multiplexed session the spec describes — submitting concurrently from
//! many tasks reuses the same underlying connection rather than opening
//! one per request.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use fanout_config::{Credentials, RuntimeConfig};
use fanout_error::{DispatchError, ErrorCode};
use fanout_sigv4::{sign, CanonicalRequestInput, DerivedKey};
use fanout_trace::SpanRef;
use std::sync::Mutex;
use std::time::Duration;

const SERVICE: &str = "lambda";
const API_VERSION_PATH: &str = "/2015-03-31/functions";

/// A persistent HTTP/2 session carrying invocation requests to a single
/// AWS-style Lambda endpoint.
pub struct InvocationSession {
    client: reqwest::Client,
    scheme: &'static str,
    host: String,
    credentials: Credentials,
    key: Mutex<DerivedKey>,
}

impl InvocationSession {
    /// Open a session, deriving today's signing key immediately (so a
    /// missing-credentials failure surfaces at construction, per spec
    /// §7, rather than on first dispatch).
    pub fn new(credentials: Credentials, runtime: &RuntimeConfig) -> Result<Self, DispatchError> {
        let host = format!("lambda.{}.amazonaws.com", credentials.region);
        Self::with_scheme(credentials, runtime, "https", host)
    }

    /// Construct a session against a custom scheme/host — used by tests
    /// to point the session at a local mock HTTP responder instead of
    /// the real AWS endpoint.
    pub fn with_host(
        credentials: Credentials,
        runtime: &RuntimeConfig,
        host: impl Into<String>,
    ) -> Result<Self, DispatchError> {
        Self::with_scheme(credentials, runtime, "http", host)
    }

    fn with_scheme(
        credentials: Credentials,
        runtime: &RuntimeConfig,
        scheme: &'static str,
        host: impl Into<String>,
    ) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(runtime.connect_timeout)
            .timeout(runtime.request_timeout)
            .build()
            .map_err(|e| {
                DispatchError::new(ErrorCode::TransportFailed, "failed to build HTTP/2 client")
                    .with_source(e)
            })?;
        let key = DerivedKey::derive(&credentials, SERVICE, &today());
        Ok(Self {
            client,
            scheme,
            host: host.into(),
            credentials,
            key: Mutex::new(key),
        })
    }

    fn derived_key(&self) -> DerivedKey {
        let today = today();
        let mut key = self.key.lock().unwrap();
        if !key.is_valid_for(&today) {
            *key = DerivedKey::derive(&self.credentials, SERVICE, &today);
        }
        key.clone()
    }

    /// Submit one invocation request and await its response body.
    ///
    /// On a non-200 status this returns `Err(DispatchError::remote_rejected)`
    /// rather than leaving the caller's future pending — see spec §9/§10.3.
    #[tracing::instrument(skip(self, payload, span), fields(function_name = %function_name))]
    pub async fn submit(
        &self,
        function_name: &str,
        payload: Vec<u8>,
        span: Option<&SpanRef>,
    ) -> Result<Vec<u8>, DispatchError> {
        let submit_span = span.map(|s| s.create_child("http2.submit"));
        let amz_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let path = format!("{API_VERSION_PATH}/{function_name}/invocations");
        let query: [(&str, &str); 1] = [("Qualifier", "$LATEST")];

        let input = CanonicalRequestInput {
            method: "POST",
            path: &path,
            query: &query,
            host: &self.host,
            amz_date: &amz_date,
            body: &payload,
        };
        let authorization = sign(&self.derived_key(), &input);
        let url = format!("{}://{}{}", self.scheme, self.host, path);

        let request = self
            .client
            .post(&url)
            .query(&query)
            .header("host", &self.host)
            .header("x-amz-date", &amz_date)
            .header("Authorization", authorization)
            .body(payload);

        if let Some(s) = &submit_span {
            s.set_tag("url", url.clone());
        }

        let response = request.send().await.map_err(|e| {
            DispatchError::new(ErrorCode::TransportFailed, "HTTP/2 request failed")
                .with_context("url", url.clone())
                .with_source(e)
        })?;
        if let Some(s) = &submit_span {
            s.end();
        }

        let response_span = span.map(|s| s.create_child("http2.response"));
        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            DispatchError::new(ErrorCode::TransportFailed, "failed to read response body")
                .with_source(e)
        })?;
        if let Some(s) = &response_span {
            s.set_tag("status", status.as_u16().to_string());
            s.end();
        }

        if status.as_u16() != 200 {
            let body_text = String::from_utf8_lossy(&body).to_string();
            tracing::error!(
                target: "fanout_net",
                status = status.as_u16(),
                body = %body_text,
                "remote invocation rejected"
            );
            return Err(DispatchError::remote_rejected(status.as_u16(), body_text));
        }
        Ok(body.to_vec())
    }

    /// The host this session talks to.
    pub fn host(&self) -> &str {
        &self.host
    }
}

fn today() -> String {
    Utc::now().format("%Y%m%d").to_string()
}

/// Connect/request timeout defaults, re-exported so callers that build a
/// session without a [`RuntimeConfig`] can still reach for sane values.
pub fn default_timeouts() -> (Duration, Duration) {
    let cfg = RuntimeConfig::default();
    (cfg.connect_timeout, cfg.request_timeout)
}
