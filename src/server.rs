use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::Bootstrap;
use crate::engine::{CacheEngine, CacheHandle, Lookup};
use crate::http_range::{build_content_range, parse_ranges, RangeSpec};
use crate::hydrator::OriginClient;
use crate::metrics;
use crate::reader::LazyRangeReader;
use crate::storage::{BlockStore, DiskStore, MemoryStore};

pub type EdgeBody = UnsyncBoxBody<Bytes, anyhow::Error>;

pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let listener = bind_listener(&cfg.server.addr)?;
    log::info!("listening on {}", listener.local_addr()?);
    serve(cfg, listener).await
}

pub async fn serve(cfg: Arc<Bootstrap>, listener: TcpListener) -> Result<()> {
    let state = build_state(&cfg)?;
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            res = listener.accept() => {
                let (stream, _) = res.context("accept tcp")?;
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&state)));
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("http connection ended: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

struct AppState {
    engine: Arc<CacheEngine>,
    origin: OriginClient,
}

fn build_state(cfg: &Bootstrap) -> Result<Arc<AppState>> {
    let limits = cfg.cache.limits()?;
    let origin = OriginClient::new(&cfg.upstream)?;

    let mut tiers: Vec<Arc<dyn BlockStore>> =
        vec![Arc::new(MemoryStore::new(limits.max_memory_usage))];
    if cfg.cache.disk_cache_enabled {
        let disk = DiskStore::open(
            cfg.cache.disk_cache_dir.clone(),
            limits.max_disk_usage,
            limits.cleaned_disk_usage,
        )?;
        tiers.push(Arc::new(disk));
    }

    let engine = CacheEngine::new(limits.block_size, Arc::new(origin.clone()), tiers);
    Ok(Arc::new(AppState { engine, origin }))
}

fn bind_listener(addr: &str) -> Result<TcpListener> {
    let bind_addr = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    let socket_addr: SocketAddr = bind_addr.parse().context("parse server.addr")?;
    let listener = std::net::TcpListener::bind(socket_addr).context("bind tcp")?;
    listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(listener)?)
}

fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();
        loop {
            tokio::select! {
                _ = async {
                    if let Some(sig) = sigterm.as_mut() {
                        let _ = sig.recv().await;
                    }
                } => {
                    let _ = shutdown.send(true);
                    break;
                }
                _ = async {
                    if let Some(sig) = sigint.as_mut() {
                        let _ = sig.recv().await;
                    }
                } => {
                    let _ = shutdown.send(true);
                    break;
                }
            }
        }
    });
}

async fn handle(req: Request<Incoming>, state: Arc<AppState>) -> Result<Response<EdgeBody>, hyper::Error> {
    let resp = route(req, state).await;
    metrics::record_status(resp.status());
    Ok(resp)
}

async fn route(req: Request<Incoming>, state: Arc<AppState>) -> Response<EdgeBody> {
    let method = req.method();
    if method != Method::GET && method != Method::HEAD {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    let key = req.uri().path().trim_start_matches('/').to_string();
    if key.is_empty() {
        return not_found();
    }

    match Arc::clone(&state.engine).get(&key, req.headers()).await {
        Ok(Lookup::Cacheable(handle)) => serve_object(&req, handle).await,
        Ok(Lookup::NotCacheable) => passthrough(&req, &state, &key).await,
        Err(err) => {
            log::warn!("{key}: lookup failed: {err:#}");
            not_found()
        }
    }
}

/// Uncached proxy path: the origin response is forwarded verbatim and never
/// touches the block stores.
async fn passthrough(req: &Request<Incoming>, state: &AppState, key: &str) -> Response<EdgeBody> {
    log::debug!("{key}: not cacheable, serving pass-through");
    match state
        .origin
        .fetch_passthrough(req.method().clone(), key, req.headers())
        .await
    {
        Ok((status, headers, body)) => {
            let mut builder = Response::builder().status(status);
            for (k, v) in headers.iter() {
                builder = builder.header(k, v);
            }
            builder
                .body(body.map_err(anyhow::Error::from).boxed_unsync())
                .unwrap()
        }
        Err(err) => {
            log::warn!("{key}: pass-through failed: {err:#}");
            not_found()
        }
    }
}

async fn serve_object(req: &Request<Incoming>, handle: CacheHandle) -> Response<EdgeBody> {
    let size = handle.size();
    let range_header = req.headers().get(header::RANGE).and_then(|v| v.to_str().ok());
    let range = resolve_range(range_header, size);
    let head_only = req.method() == Method::HEAD;

    let mut builder = Response::builder().header(header::ACCEPT_RANGES, "bytes");
    let meta = handle.metadata();
    if let Some(content_type) = &meta.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    if let Some(encoding) = &meta.content_encoding {
        builder = builder.header(header::CONTENT_ENCODING, encoding);
    }
    if let Some(etag) = &meta.etag {
        builder = builder.header(header::ETAG, etag);
    }
    if let Some(last_modified) = &meta.last_modified {
        builder = builder.header(header::LAST_MODIFIED, last_modified);
    }

    match range {
        Some(spec) => {
            builder = builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    build_content_range(spec.start, spec.end(), size),
                )
                .header(header::CONTENT_LENGTH, spec.length.to_string());
            if head_only {
                return builder.body(empty_body()).unwrap();
            }
            let reader = LazyRangeReader::new(handle, spec.start, spec.start + spec.length);
            builder.body(stream_body(reader)).unwrap()
        }
        None => {
            builder = builder
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, size.to_string());
            if let Some(md5) = &meta.content_md5 {
                builder = builder.header("content-md5", md5);
            }
            if head_only {
                return builder.body(empty_body()).unwrap();
            }
            builder.body(stream_body(LazyRangeReader::full(handle))).unwrap()
        }
    }
}

/// A missing, malformed, over-long, or multi-spec Range header downgrades
/// the request to a full-body response rather than failing it.
fn resolve_range(header: Option<&str>, size: u64) -> Option<RangeSpec> {
    let header = header?;
    let ranges = match parse_ranges(header, size) {
        Ok(ranges) => ranges,
        Err(err) => {
            log::debug!("ignoring range header {header:?}: {err}");
            return None;
        }
    };
    let total: u64 = ranges.iter().map(|r| r.length).sum();
    if total > size {
        log::debug!("range header {header:?} asks for more than the object holds, serving full body");
        return None;
    }
    if ranges.len() != 1 {
        log::debug!("multipart range {header:?} not supported, serving full body");
        return None;
    }
    Some(ranges[0])
}

fn stream_body(reader: LazyRangeReader) -> EdgeBody {
    let stream = futures_util::stream::try_unfold(reader, |mut reader| async move {
        match reader.next_chunk().await? {
            Some(chunk) => Ok(Some((Frame::data(chunk), reader))),
            None => Ok(None),
        }
    });
    StreamBody::new(stream).boxed_unsync()
}

fn full_body(bytes: Bytes) -> EdgeBody {
    Full::new(bytes).map_err(|err| match err {}).boxed_unsync()
}

fn empty_body() -> EdgeBody {
    full_body(Bytes::new())
}

fn not_found() -> Response<EdgeBody> {
    text_response(StatusCode::NOT_FOUND, "not found")
}

fn text_response(status: StatusCode, body: &str) -> Response<EdgeBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(Bytes::from(body.to_string())))
        .unwrap()
}
