//! HTTP client: request assembly, credential injection, middleware, error
//! classification, and the coalesced GET path.

use super::coalesce::{request_hash, InflightCache};
use super::envelope::ApiEnvelope;
use super::middleware::{
    run_after, run_before, AfterFn, AfterReturning, BeforeFn, BeforeRequest, RequestContext,
    Verdict,
};
use super::options::{RequestOptions, ResponseType, Terminal};
use super::{HttpError, HttpPayload, CANCELED_CODE};
use crate::cache::{keys, Cache};
use futures::future::{AbortHandle, Abortable};
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which API root the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ApiBase {
    #[default]
    #[serde(rename = "api")]
    Api,
    #[serde(rename = "api2")]
    Api2,
}

impl ApiBase {
    pub fn path(&self) -> &'static str {
        match self {
            ApiBase::Api => "/api",
            ApiBase::Api2 => "/api2",
        }
    }
}

/// Static client settings; credentials are read from the cache per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    /// Scheme and authority, e.g. `https://portal.example.com`.
    pub origin: String,
    #[serde(default)]
    pub base: ApiBase,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub language: Option<String>,
}

fn default_user_agent() -> String {
    "Mozilla/5.0".to_string()
}

struct Inner {
    http: reqwest::Client,
    origin: String,
    base: ApiBase,
    terminal: Terminal,
    language: Option<String>,
    cache: Arc<dyn Cache>,
    before: RwLock<Vec<Arc<dyn BeforeRequest>>>,
    after: RwLock<Vec<Arc<dyn AfterReturning>>>,
    inflight: InflightCache,
}

#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<Inner>,
}

impl HttpClient {
    pub fn new(settings: &HttpSettings, cache: Arc<dyn Cache>) -> Result<Self, HttpError> {
        let http = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| HttpError::Build(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                origin: settings.origin.trim_end_matches('/').to_string(),
                base: settings.base,
                terminal: super::options::terminal_for_user_agent(&settings.user_agent),
                language: settings.language.clone(),
                cache,
                before: RwLock::new(Vec::new()),
                after: RwLock::new(Vec::new()),
                inflight: InflightCache::default(),
            }),
        })
    }

    pub fn add_before(&self, middleware: Arc<dyn BeforeRequest>) {
        self.inner.before.write().push(middleware);
    }

    /// Register a sync before-middleware; it is lifted into the async
    /// contract here.
    pub fn add_before_fn<F>(&self, f: F)
    where
        F: Fn(&mut RequestContext) -> Verdict + Send + Sync + 'static,
    {
        self.add_before(Arc::new(BeforeFn(f)));
    }

    pub fn add_after(&self, middleware: Arc<dyn AfterReturning>) {
        self.inner.after.write().push(middleware);
    }

    pub fn add_after_fn<F>(&self, f: F)
    where
        F: Fn(&mut ApiEnvelope) -> Verdict + Send + Sync + 'static,
    {
        self.add_after(Arc::new(AfterFn(f)));
    }

    pub async fn get(
        &self,
        url: &str,
        params: Value,
        options: RequestOptions,
    ) -> Result<HttpPayload, HttpError> {
        self.execute(Method::GET, url, params, options).await
    }

    pub async fn post(
        &self,
        url: &str,
        params: Value,
        options: RequestOptions,
    ) -> Result<HttpPayload, HttpError> {
        self.execute(Method::POST, url, params, options).await
    }

    pub async fn put(
        &self,
        url: &str,
        params: Value,
        options: RequestOptions,
    ) -> Result<HttpPayload, HttpError> {
        self.execute(Method::PUT, url, params, options).await
    }

    pub async fn patch(
        &self,
        url: &str,
        params: Value,
        options: RequestOptions,
    ) -> Result<HttpPayload, HttpError> {
        self.execute(Method::PATCH, url, params, options).await
    }

    pub async fn delete(
        &self,
        url: &str,
        params: Value,
        options: RequestOptions,
    ) -> Result<HttpPayload, HttpError> {
        self.execute(Method::DELETE, url, params, options).await
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        params: Value,
        options: RequestOptions,
    ) -> Result<HttpPayload, HttpError> {
        let mut ctx = RequestContext::new(method, url, strip_null_params(params));

        let before = self.inner.before.read().clone();
        if run_before(&before, &mut ctx).await == Verdict::Halt {
            return Err(HttpError::Rejected);
        }

        // Only GETs coalesce; everything else goes straight to the wire.
        if ctx.method == Method::GET {
            let key = request_hash(
                ctx.method.as_str(),
                &ctx.url,
                &ctx.params,
                &options.cache_signature(),
            );
            let inner = self.inner.clone();
            let (future, fresh) = self
                .inner
                .inflight
                .get_or_insert(key, move || send_once(inner, ctx, options).boxed());
            if !fresh {
                debug!("coalesced GET onto an in-flight request");
            }
            future.await
        } else {
            send_once(self.inner.clone(), ctx, options).await
        }
    }
}

/// Drop null params; non-object inputs become an empty map.
fn strip_null_params(params: Value) -> Map<String, Value> {
    match params {
        Value::Object(map) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
        _ => Map::new(),
    }
}

fn query_pairs(params: &Map<String, Value>) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(k, v)| {
            let rendered = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), rendered)
        })
        .collect()
}

async fn send_once(
    inner: Arc<Inner>,
    ctx: RequestContext,
    options: RequestOptions,
) -> Result<HttpPayload, HttpError> {
    let url = format!(
        "{}{}/{}{}",
        inner.origin,
        inner.base.path(),
        options.api_prefix(),
        ctx.url
    );
    let mut request = inner.http.request(ctx.method.clone(), &url);

    if let Some(token) = inner.cache.get_string(keys::TOKEN) {
        request = request.header("token", &token).header("access-token", &token);
    }
    request = request.header("terminal", inner.terminal.as_str());
    if let Some(language) = &inner.language {
        request = request.header("language", language);
    }
    for (name, value) in options.extra_headers() {
        request = request.header(name, value);
    }
    for (name, value) in &ctx.headers {
        request = request.header(name, value);
    }

    let mut body_len = 0u64;
    if ctx.method == Method::GET {
        request = request.query(&query_pairs(&ctx.params));
        if !options.hide_times {
            let buster: u32 = rand::thread_rng().gen();
            request = request.query(&[("_r", buster.to_string())]);
        }
    } else if options.using_form_data {
        request = request.form(&query_pairs(&ctx.params));
    } else if options.using_blob {
        let bytes = serde_json::to_vec(&Value::Object(ctx.params.clone()))
            .map_err(|e| HttpError::Build(e.to_string()))?;
        body_len = bytes.len() as u64;
        request = request
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
    } else {
        body_len = Value::Object(ctx.params.clone()).to_string().len() as u64;
        request = request.json(&ctx.params);
    }
    request = request.timeout(Duration::from_millis(options.timeout_ms()));

    let send = request.send();
    let outcome = match &options.cancel {
        Some(cancel) => {
            let (handle, registration) = AbortHandle::new_pair();
            cancel.bind(handle);
            match Abortable::new(send, registration).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(HttpError::Canceled {
                        code: CANCELED_CODE,
                    })
                }
            }
        }
        None => send.await,
    };

    let response = match outcome {
        Ok(response) => response,
        Err(e) => {
            // Never reached the server, or the connection died mid-flight.
            let code = e.status().map(|s| i64::from(s.as_u16())).unwrap_or(0);
            let envelope = ApiEnvelope::synthesized(code, e.to_string());
            return settle_failure(envelope, &options);
        }
    };

    if let Some(progress) = &options.on_upload_progress {
        progress(body_len, Some(body_len));
    }

    let status = response.status();
    let status_code = i64::from(status.as_u16());
    let status_text = status.canonical_reason().unwrap_or("unknown").to_string();

    match options.response_type {
        ResponseType::Json => {
            let bytes = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    let envelope = ApiEnvelope::synthesized(status_code, e.to_string());
                    return settle_failure(envelope, &options);
                }
            };
            match ApiEnvelope::decode(&bytes) {
                Some(mut envelope) => {
                    let after = inner.after.read().clone();
                    if run_after(&after, &mut envelope).await == Verdict::Halt {
                        return settle_envelope_failure(envelope, &options);
                    }
                    if envelope.is_success() {
                        Ok(HttpPayload::Envelope(envelope))
                    } else {
                        settle_envelope_failure(envelope, &options)
                    }
                }
                None => {
                    // Not an envelope; classify by the raw HTTP outcome.
                    let envelope = match serde_json::from_slice::<Value>(&bytes) {
                        Ok(data) => ApiEnvelope {
                            code: status_code,
                            data,
                            desc: status_text,
                        },
                        Err(_) => ApiEnvelope::synthesized(status_code, status_text),
                    };
                    if status.is_success() {
                        Ok(HttpPayload::Envelope(envelope))
                    } else {
                        settle_failure(envelope, &options)
                    }
                }
            }
        }
        ResponseType::Text | ResponseType::Document => {
            if !status.is_success() {
                let envelope = ApiEnvelope::synthesized(status_code, status_text);
                return settle_failure(envelope, &options);
            }
            match response.text().await {
                Ok(text) => Ok(HttpPayload::Text(text)),
                Err(e) => settle_failure(ApiEnvelope::synthesized(status_code, e.to_string()), &options),
            }
        }
        ResponseType::ArrayBuffer | ResponseType::Blob | ResponseType::Stream => {
            if !status.is_success() {
                let envelope = ApiEnvelope::synthesized(status_code, status_text);
                return settle_failure(envelope, &options);
            }
            let total = response.content_length();
            let mut received = 0u64;
            let mut body = Vec::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => {
                        received += chunk.len() as u64;
                        body.extend_from_slice(&chunk);
                        if let Some(progress) = &options.on_download_progress {
                            progress(received, total);
                        }
                    }
                    Err(e) => {
                        let envelope = ApiEnvelope::synthesized(status_code, e.to_string());
                        return settle_failure(envelope, &options);
                    }
                }
            }
            Ok(HttpPayload::Bytes(body))
        }
    }
}

/// Raw-HTTP failure: resolve with the synthesized payload or reject,
/// depending on the catch flag.
fn settle_failure(
    envelope: ApiEnvelope,
    options: &RequestOptions,
) -> Result<HttpPayload, HttpError> {
    if options.catches() {
        Ok(HttpPayload::Envelope(envelope))
    } else {
        Err(HttpError::Http {
            code: envelope.code,
            desc: envelope.desc,
        })
    }
}

/// Envelope-shaped failure: same catch rule, but the rejection keeps the
/// envelope's data.
fn settle_envelope_failure(
    envelope: ApiEnvelope,
    options: &RequestOptions,
) -> Result<HttpPayload, HttpError> {
    if options.catches() {
        Ok(HttpPayload::Envelope(envelope))
    } else {
        Err(HttpError::Api {
            code: envelope.code,
            desc: envelope.desc,
            data: envelope.data,
        })
    }
}
