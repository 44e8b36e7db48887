//! Artifact transports
//!
//! A transport turns an [`ArtifactDescriptor`] into one readable byte
//! stream. Direct HTTPS and torrent-descriptor transports are
//! interchangeable; the verifier downstream does not know which one fed it.

use super::config::{Settings, TransportKind};
use super::locator::{ArtifactDescriptor, Locator};
use super::torrent::TorrentTransport;
use crate::error::{NodeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};

/// Upper bound for checksum manifests, torrent descriptors and tracker replies
pub const MAX_REFERENCE_FILE_SIZE: usize = 16 * 1024 * 1024;

/// Most memory reserved up front from an announced length
const INITIAL_RESERVE: usize = 1 << 20;

/// Chunks of the archive as they arrive
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// An opened artifact download
pub struct ArtifactStream {
    /// Expected length in bytes, for progress reporting
    pub total_len: Option<u64>,
    pub body: ByteStream,
}

/// Source of artifact bytes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Open a stream of the archive's bytes
    async fn open(&self, artifact: &ArtifactDescriptor) -> Result<ArtifactStream>;
}

/// Plain HTTPS download from a release mirror
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: create_client()?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn open(&self, artifact: &ArtifactDescriptor) -> Result<ArtifactStream> {
        let url = match artifact.locator(Some(&self.base_url)) {
            Locator::Url(url) => url,
            Locator::TorrentEntry(name) => {
                return Err(NodeError::transport(format!("no URL for {}", name)));
            }
        };
        get_stream(&self.client, &url).await
    }
}

/// Pick the transport configured in `settings`
pub fn transport_for(settings: &Settings) -> Result<Box<dyn Transport>> {
    match settings.transport {
        TransportKind::Http => Ok(Box::new(HttpTransport::new(settings.download_url.clone())?)),
        TransportKind::Torrent => Ok(Box::new(TorrentTransport::new(settings.torrent_path())?)),
    }
}

/// Create HTTP client with appropriate headers
pub(crate) fn create_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("bitcoind-launcher/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| NodeError::transport(format!("Failed to create HTTP client: {}", e)))
}

/// GET `url` and expose the body as a stream; anything but 200 is a failure
pub(crate) async fn get_stream(client: &Client, url: &str) -> Result<ArtifactStream> {
    get_stream_from(client, url, 0).await
}

/// GET `url` starting at byte `offset` of the resource
///
/// A server that ignores the `Range` header and answers 200 is accepted; the
/// leading `offset` bytes are skipped so the stream still starts at `offset`.
pub(crate) async fn get_stream_from(
    client: &Client,
    url: &str,
    offset: u64,
) -> Result<ArtifactStream> {
    log::info!("Downloading {}", url);

    let mut request = client.get(url);
    if offset > 0 {
        request = request.header(RANGE, format!("bytes={}-", offset));
    }
    let response = request
        .send()
        .await
        .map_err(|e| NodeError::transport(format!("Failed to start download: {}", e)))?;

    let status = response.status();
    let partial = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
    if status != StatusCode::OK && !partial {
        return Err(NodeError::TransportFailure {
            status: Some(status.as_u16()),
            cause: url.to_string(),
        });
    }

    let mut skip = if partial { 0 } else { offset };
    let total_len = response.content_length().map(|len| len.saturating_sub(skip));
    let body = response
        .bytes_stream()
        .map_err(|e| NodeError::transport(format!("Download error: {}", e)))
        .map_ok(move |mut chunk| {
            if skip > 0 {
                let n = skip.min(chunk.len() as u64) as usize;
                chunk = chunk.slice(n..);
                skip -= n as u64;
            }
            chunk
        })
        .try_filter(|chunk| futures_util::future::ready(!chunk.is_empty()))
        .boxed();

    Ok(ArtifactStream { total_len, body })
}

/// Fetch a small reference file in full
///
/// Fails once the body exceeds [`MAX_REFERENCE_FILE_SIZE`], whatever the
/// server announced as its length.
pub async fn fetch_bytes(url: &str) -> Result<Bytes> {
    let client = create_client()?;
    let stream = get_stream(&client, url).await?;
    collect_limited(stream, url, MAX_REFERENCE_FILE_SIZE).await
}

/// Read a whole stream into memory, failing past `limit` bytes
pub(crate) async fn collect_limited(
    mut stream: ArtifactStream,
    url: &str,
    limit: usize,
) -> Result<Bytes> {
    let too_large = |len: u64| {
        NodeError::transport(format!(
            "{} is larger than the {} byte limit ({} bytes)",
            url, limit, len
        ))
    };

    if let Some(len) = stream.total_len {
        if len > limit as u64 {
            return Err(too_large(len));
        }
    }

    let reserve = stream.total_len.unwrap_or(0).min(INITIAL_RESERVE as u64) as usize;
    let mut buf = Vec::with_capacity(reserve);
    while let Some(chunk) = stream.body.next().await {
        let chunk = chunk?;
        if buf.len() + chunk.len() > limit {
            return Err(too_large((buf.len() + chunk.len()) as u64));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::node::locator::Platform;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `status`/`body` to every connection on an ephemeral port
    pub(crate) async fn serve(status: u16, body: Vec<u8>) -> String {
        serve_routes(vec![("/", status, body)]).await
    }

    /// Serve the first route whose prefix matches the request path; 404 otherwise
    pub(crate) async fn serve_routes(routes: Vec<(&'static str, u16, Vec<u8>)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes = std::sync::Arc::new(routes);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut request = [0u8; 4096];
                    let n = socket.read(&mut request).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&request[..n]);
                    let path = request.split_whitespace().nth(1).unwrap_or("/");

                    let (status, body) = routes
                        .iter()
                        .find(|(prefix, _, _)| path.starts_with(prefix))
                        .map(|(_, status, body)| (*status, body.clone()))
                        .unwrap_or((404, Vec::new()));

                    let head = format!(
                        "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        status,
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    /// Write `response` verbatim to every connection, ignoring the request
    pub(crate) async fn serve_raw(response: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = [0u8; 4096];
                    let _ = socket.read(&mut request).await;
                    let _ = socket.write_all(response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    fn descriptor() -> ArtifactDescriptor {
        ArtifactDescriptor::new(Platform::from_names("linux", "x86_64").unwrap(), "0.21.0").unwrap()
    }

    #[tokio::test]
    async fn test_http_transport_streams_body() {
        let base = serve(200, b"archive bytes".to_vec()).await;
        let transport = HttpTransport::new(base).unwrap();

        let mut stream = transport.open(&descriptor()).await.unwrap();
        assert_eq!(stream.total_len, Some(13));

        let mut body = Vec::new();
        while let Some(chunk) = stream.body.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"archive bytes");
    }

    #[tokio::test]
    async fn test_non_200_is_transport_failure() {
        let base = serve(404, b"missing".to_vec()).await;
        let transport = HttpTransport::new(base).unwrap();

        match transport.open(&descriptor()).await {
            Err(NodeError::TransportFailure { status, cause }) => {
                assert_eq!(status, Some(404));
                assert!(cause.ends_with("bitcoin-0.21.0-x86_64-linux-gnu.tar.gz"));
            }
            other => panic!("expected TransportFailure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_fetch_bytes() {
        let base = serve(200, b"sums".to_vec()).await;
        let bytes = fetch_bytes(&format!("{}/SHA256SUMS.asc", base)).await.unwrap();
        assert_eq!(&bytes[..], b"sums");
    }

    #[tokio::test]
    async fn test_fetch_bytes_rejects_huge_content_length() {
        let base = serve_raw(
            b"HTTP/1.1 200 OK\r\nContent-Length: 1000000000000000\r\nConnection: close\r\n\r\nabc",
        )
        .await;

        let err = fetch_bytes(&format!("{}/SHA256SUMS.asc", base)).await.unwrap_err();
        assert!(matches!(err, NodeError::TransportFailure { status: None, .. }));
        assert!(err.to_string().contains("byte limit"));
    }

    #[tokio::test]
    async fn test_body_without_length_is_still_bounded() {
        // Close-delimited body, so only the running count can catch it
        let base = serve_raw(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n0123456789abcdef").await;
        let url = format!("{}/bitcoin.torrent", base);
        let client = create_client().unwrap();

        let stream = get_stream(&client, &url).await.unwrap();
        assert_eq!(stream.total_len, None);
        let err = collect_limited(stream, &url, 8).await.unwrap_err();
        assert!(err.to_string().contains("byte limit"));

        let stream = get_stream(&client, &url).await.unwrap();
        let body = collect_limited(stream, &url, 64).await.unwrap();
        assert_eq!(&body[..], b"0123456789abcdef");
    }

    #[tokio::test]
    async fn test_range_ignored_by_server_skips_prefix() {
        let base = serve(200, b"0123456789".to_vec()).await;
        let client = create_client().unwrap();

        let mut stream = get_stream_from(&client, &format!("{}/a.tar.gz", base), 4)
            .await
            .unwrap();
        assert_eq!(stream.total_len, Some(6));

        let mut body = Vec::new();
        while let Some(chunk) = stream.body.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"456789");
    }
}
