use std::error::Error;
use std::io;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use rand::prelude::IndexedRandom;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, ClientBuilder, Proxy};

use super::{FieldMap, HttpRequest, HttpResponse, Transport, TransportError, TransportErrorKind};

/// reqwest-backed `Transport`.
pub struct HttpClient {
    inner: Client,
    user_agents: Vec<&'static str>,
    default_timeout: Duration,
    default_headers: Vec<(String, String)>,
}

impl HttpClient {
    pub fn new(
        timeout_seconds: u64,
        proxy_url: Option<&str>,
        custom_headers: &[(String, String)],
    ) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(timeout_seconds);

        let mut builder = ClientBuilder::new()
            .timeout(timeout)
            .danger_accept_invalid_certs(true);

        if let Some(proxy) = proxy_url {
            builder = builder.proxy(Proxy::all(proxy)?);
        }

        let inner = builder.build()?;

        let user_agents = vec![
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) \
             Gecko/20100101 Firefox/120.0",
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_0) AppleWebKit/605.1.15 \
             (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
        ];

        Ok(Self {
            inner,
            user_agents,
            default_timeout: timeout,
            default_headers: custom_headers.to_vec(),
        })
    }

    fn get_random_user_agent(&self) -> &'static str {
        let mut rng = rand::rng();
        *self.user_agents.choose(&mut rng).unwrap_or(&"Mozilla/5.0")
    }

    /// Fills in what the transport adds on its own, so the request stored on
    /// the response is the one that actually went out.
    fn outbound(&self, req: &HttpRequest) -> HttpRequest {
        let mut sent = req.clone();
        for (key, value) in &self.default_headers {
            if !has_header(&sent.headers, key) {
                sent.headers.insert(key.clone(), value.clone());
            }
        }
        if !has_header(&sent.headers, USER_AGENT.as_str()) {
            sent.headers
                .insert("User-Agent".to_string(), self.get_random_user_agent().to_string());
        }
        if !sent.body.is_empty() && !has_header(&sent.headers, CONTENT_TYPE.as_str()) {
            sent.headers.insert(
                "Content-Type".to_string(),
                sent.body.default_content_type().to_string(),
            );
        }
        sent
    }
}

fn has_header(headers: &FieldMap, name: &str) -> bool {
    headers.keys().any(|k| k.eq_ignore_ascii_case(name))
}

fn classify(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_builder() {
        TransportErrorKind::InvalidRequest
    } else if err.is_connect() || (err.is_request() && connection_dropped(err)) {
        TransportErrorKind::Connection
    } else if err.is_body() || err.is_decode() {
        TransportErrorKind::Other("BodyError".to_string())
    } else if err.is_redirect() {
        TransportErrorKind::Other("TooManyRedirects".to_string())
    } else {
        TransportErrorKind::Other("RequestException".to_string())
    }
}

/// True when some error in the source chain is a reset or aborted socket.
fn connection_dropped(err: &(dyn Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            if matches!(
                io.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::new(classify(&err), err.to_string())
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn send(&self, req: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let sent = self.outbound(req);
        let url = sent.render_url();

        let mut builder = self.inner.request(sent.method.clone(), url.as_str());

        for (name, value) in &sent.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::new(TransportErrorKind::InvalidRequest, e.to_string())
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                TransportError::new(TransportErrorKind::InvalidRequest, e.to_string())
            })?;
            builder = builder.header(name, value);
        }

        if !sent.body.is_empty() {
            builder = builder.body(sent.body.render());
        }

        builder = builder.timeout(self.default_timeout);

        debug!("{} {}", sent.method, url);
        let start = Instant::now();
        let response = builder.send().await?;

        let status = response.status().as_u16();
        let mut headers = FieldMap::new();
        for (name, value) in response.headers() {
            headers.insert(
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }
        let body = response.text().await?;
        let elapsed = start.elapsed();

        Ok(HttpResponse {
            status,
            headers,
            body,
            elapsed,
            request: sent,
        })
    }
}
