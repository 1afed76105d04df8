#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use ocelot::config::Bootstrap;
use rand::RngCore;
use tokio::net::TcpListener;

pub struct Proxy {
    pub addr: SocketAddr,
}

pub async fn start_proxy<F>(mirror_url: &str, disk_dir: &Path, tweak: F) -> Proxy
where
    F: FnOnce(&mut Bootstrap),
{
    let mut cfg = Bootstrap::default();
    cfg.upstream.mirror_url = mirror_url.to_string();
    cfg.upstream.insecure_skip_verify = true;
    cfg.upstream.timeout = Duration::from_secs(5);
    cfg.cache.block_size = "1K".to_string();
    cfg.cache.max_memory_usage = "1M".to_string();
    cfg.cache.max_disk_usage = "4M".to_string();
    cfg.cache.cleaned_disk_usage = "2M".to_string();
    cfg.cache.disk_cache_dir = disk_dir.to_string_lossy().to_string();
    tweak(&mut cfg);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = ocelot::server::serve(Arc::new(cfg), listener).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    Proxy { addr }
}

#[derive(Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl Proxy {
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request(Method::GET, path, HeaderMap::new()).await
    }

    pub async fn get_range(&self, path: &str, range: &str) -> TestResponse {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, range.parse().unwrap());
        self.request(Method::GET, path, headers).await
    }

    pub async fn request(&self, method: Method, path: &str, headers: HeaderMap) -> TestResponse {
        let stream = tokio::net::TcpStream::connect(self.addr)
            .await
            .expect("connect proxy");
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, self.addr.to_string());
        for (k, v) in headers.iter() {
            builder = builder.header(k, v);
        }
        let req = builder.body(Full::new(Bytes::new())).expect("request");

        let resp = sender.send_request(req).await.expect("send request");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.expect("body").to_bytes();

        TestResponse {
            status,
            headers,
            body,
        }
    }
}

pub struct MockServer {
    addr: SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let resp = handler(req);
                                async move { Ok::<_, hyper::Error>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            shutdown: Some(shutdown),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

#[derive(Clone)]
pub struct MockFile {
    pub path: PathBuf,
    pub md5: String,
    pub size: usize,
    _temp_dir: Arc<tempfile::TempDir>,
}

pub fn gen_file(size: usize) -> MockFile {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    let dir = Arc::new(tempfile::tempdir().expect("tempdir"));
    let path = dir.path().join(format!("file-{size}.bin"));
    std::fs::write(&path, &buf).expect("write file");
    let digest = format!("{:x}", md5::compute(&buf));
    MockFile {
        path,
        md5: digest,
        size,
        _temp_dir: dir,
    }
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

pub fn read_range(path: &PathBuf, start: usize, length: usize) -> Vec<u8> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = std::fs::File::open(path).expect("open file");
    file.seek(SeekFrom::Start(start as u64)).expect("seek");
    let mut buf = vec![0u8; length];
    file.read_exact(&mut buf).expect("read range");
    buf
}

/// An origin that serves one file with HEAD metadata probes and single
/// closed-range GETs, the two requests the proxy issues. The callback can
/// inspect the request and adjust the response headers.
pub fn file_origin<F>(file: &MockFile, cb: F) -> impl Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync
where
    F: Fn(&Request<Incoming>, &mut HeaderMap) + Send + Sync + 'static,
{
    let file = file.clone();
    let cb = Arc::new(cb);
    move |req: Request<Incoming>| {
        let bytes = std::fs::read(&file.path).expect("read file");
        let mut headers = HeaderMap::new();
        headers.insert("Cache-Control", "max-age=60".parse().unwrap());
        headers.insert("Content-Type", "application/octet-stream".parse().unwrap());
        headers.insert("ETag", format!("\"{}\"", file.md5).parse().unwrap());
        headers.insert("Content-MD5", file.md5.parse().unwrap());
        headers.insert(
            "Last-Modified",
            httpdate::fmt_http_date(std::time::SystemTime::now())
                .parse()
                .unwrap(),
        );
        cb(&req, &mut headers);

        if req.method() == Method::HEAD {
            headers.insert("Content-Length", bytes.len().to_string().parse().unwrap());
            return build_response(StatusCode::OK, headers, Bytes::new());
        }

        match req.headers().get(header::RANGE).and_then(|v| v.to_str().ok()) {
            Some(range) => {
                let (start, end) = parse_closed_range(range);
                let end = end.min(bytes.len() - 1);
                let slice = Bytes::from(bytes[start..=end].to_vec());
                headers.insert("Content-Length", slice.len().to_string().parse().unwrap());
                headers.insert(
                    "Content-Range",
                    format!("bytes {start}-{end}/{}", bytes.len()).parse().unwrap(),
                );
                build_response(StatusCode::PARTIAL_CONTENT, headers, slice)
            }
            None => {
                headers.insert("Content-Length", bytes.len().to_string().parse().unwrap());
                build_response(StatusCode::OK, headers, Bytes::from(bytes))
            }
        }
    }
}

fn parse_closed_range(raw: &str) -> (usize, usize) {
    let spec = raw.strip_prefix("bytes=").expect("bytes prefix");
    let (start, end) = spec.split_once('-').expect("closed range");
    (start.parse().expect("start"), end.parse().expect("end"))
}

pub fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (k, v) in headers.iter() {
        builder = builder.header(k, v);
    }
    builder.body(Full::new(body)).unwrap()
}

/// Counts the block files currently persisted under a disk cache directory.
pub fn disk_block_count(dir: &Path) -> usize {
    let mut count = 0;
    let Ok(level1) = std::fs::read_dir(dir) else {
        return 0;
    };
    for l1 in level1.flatten() {
        if !l1.path().is_dir() {
            continue;
        }
        for l2 in std::fs::read_dir(l1.path()).into_iter().flatten().flatten() {
            if !l2.path().is_dir() {
                continue;
            }
            count += std::fs::read_dir(l2.path()).into_iter().flatten().flatten().count();
        }
    }
    count
}
