use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::{header, HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::cacheability::{self, Decision};
use crate::config;
use crate::storage::ObjectMetadata;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

#[derive(Clone)]
pub struct Probe {
    pub metadata: ObjectMetadata,
    pub decision: Decision,
}

/// Fetches object metadata and block-sized byte spans from the origin.
/// Behind a trait so the engine can be driven by counting test doubles.
pub trait Hydrator: Send + Sync {
    fn fetch_metadata(&self, key: &str, client_headers: HeaderMap) -> BoxFuture<Result<Probe>>;
    fn fetch_range(&self, key: &str, start: u64, end: u64) -> BoxFuture<Result<Bytes>>;
}

#[derive(Clone)]
pub struct OriginClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    base_url: String,
    timeout: Duration,
}

impl OriginClient {
    pub fn new(cfg: &config::Upstream) -> Result<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(false);
        let https = if cfg.insecure_skip_verify {
            let tls = insecure_tls_config();
            HttpsConnectorBuilder::new()
                .with_tls_config(tls)
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(connector)
        } else {
            HttpsConnectorBuilder::new()
                .with_native_roots()
                .context("load native tls roots")?
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(connector)
        };
        let client = Client::builder(TokioExecutor::new()).build(https);
        Ok(Self {
            client,
            base_url: cfg.mirror_url.trim_end_matches('/').to_string(),
            timeout: cfg.timeout,
        })
    }

    fn object_url(&self, key: &str) -> Result<Uri> {
        let full = format!("{}/{}", self.base_url, key);
        full.parse::<Uri>().with_context(|| format!("parse origin uri {full}"))
    }

    /// Uncached proxy fetch for objects the engine refuses to cache: the
    /// origin response streams through verbatim.
    pub async fn fetch_passthrough(
        &self,
        method: Method,
        key: &str,
        client_headers: &HeaderMap,
    ) -> Result<(StatusCode, HeaderMap, Incoming)> {
        let uri = self.object_url(key)?;
        let mut req = http::Request::builder().method(method).uri(uri);
        for (k, v) in client_headers.iter() {
            if k != header::HOST {
                req = req.header(k, v);
            }
        }
        let req = req.body(Full::new(Bytes::new())).context("build passthrough request")?;
        let resp = with_timeout(self.timeout, async {
            self.client.request(req).await.context("origin passthrough")
        })
        .await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        Ok((status, headers, resp.into_body()))
    }
}

impl Hydrator for OriginClient {
    fn fetch_metadata(&self, key: &str, client_headers: HeaderMap) -> BoxFuture<Result<Probe>> {
        let client = self.client.clone();
        let uri = self.object_url(key);
        let timeout = self.timeout;
        let key = key.to_string();
        Box::pin(async move {
            let uri = uri?;
            let req = http::Request::builder()
                .method(Method::HEAD)
                .uri(uri)
                .body(Full::new(Bytes::new()))
                .context("build metadata probe")?;
            let resp = with_timeout(timeout, async {
                client.request(req).await.with_context(|| format!("metadata probe for {key}"))
            })
            .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(anyhow!("metadata probe for {key}: unexpected status {status}"));
            }
            let headers = resp.headers();
            let size = headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| anyhow!("metadata probe for {key}: missing Content-Length"))?;

            let decision =
                cacheability::evaluate(&client_headers, headers, status, &Method::GET, SystemTime::now());

            let metadata = ObjectMetadata {
                size,
                content_type: header_string(headers, header::CONTENT_TYPE),
                content_encoding: header_string(headers, header::CONTENT_ENCODING),
                content_md5: headers
                    .get("content-md5")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string()),
                etag: header_string(headers, header::ETAG),
                last_modified: header_string(headers, header::LAST_MODIFIED),
                expires_at: decision.expires_at,
            };
            Ok(Probe { metadata, decision })
        })
    }

    fn fetch_range(&self, key: &str, start: u64, end: u64) -> BoxFuture<Result<Bytes>> {
        let client = self.client.clone();
        let uri = self.object_url(key);
        let timeout = self.timeout;
        let key = key.to_string();
        Box::pin(async move {
            let uri = uri?;
            // half-open [start, end) here, inclusive on the wire
            let req = http::Request::builder()
                .method(Method::GET)
                .uri(uri)
                .header(header::RANGE, format!("bytes={}-{}", start, end - 1))
                .body(Full::new(Bytes::new()))
                .context("build range request")?;
            let resp = with_timeout(timeout, async {
                client
                    .request(req)
                    .await
                    .with_context(|| format!("range fetch for {key} [{start}, {end})"))
            })
            .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(anyhow!("range fetch for {key}: unexpected status {status}"));
            }
            let body = with_timeout(timeout, async {
                resp.into_body()
                    .collect()
                    .await
                    .with_context(|| format!("read range body for {key}"))
            })
            .await?
            .to_bytes();

            let want = (end - start) as usize;
            if status == StatusCode::PARTIAL_CONTENT {
                if body.len() != want {
                    return Err(anyhow!(
                        "range fetch for {key}: expected {want} bytes, origin sent {}",
                        body.len()
                    ));
                }
                return Ok(body);
            }
            // origin ignored the Range header and sent the whole object
            if body.len() < end as usize {
                return Err(anyhow!(
                    "range fetch for {key}: full response shorter than requested span"
                ));
            }
            Ok(body.slice(start as usize..end as usize))
        })
    }
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|v| v.to_string())
}

async fn with_timeout<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(anyhow!("origin request timed out after {timeout:?}")),
    }
}

fn insecure_tls_config() -> rustls::ClientConfig {
    let provider = rustls::crypto::ring::default_provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
        .expect("tls versions");
    let verifier = Arc::new(NoVerifier {});
    builder
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth()
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
