//! Tracker announces (BEP 3 HTTP, BEP 15 UDP) for peer discovery
//!
//! Only the peer list is used. We announce with `left` set to the one
//! selected file's length, since nothing else will be downloaded.

use super::downloader::{collect_limited, get_stream};
use super::torrent::Bencode;
use crate::error::{NodeError, Result};
use bytes::{Buf, BufMut, BytesMut};
use reqwest::Client;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use url::Url;

/// Port we report; we never accept inbound connections
const ANNOUNCE_PORT: u16 = 6881;

/// Tracker replies are small; anything bigger is not a tracker
const MAX_RESPONSE_LEN: usize = 1 << 20;

const UDP_TIMEOUT: Duration = Duration::from_secs(5);
const UDP_PROTOCOL_ID: u64 = 0x0417_2710_1980;

/// What we tell trackers about ourselves
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub left: u64,
}

/// Ask one tracker for peers
pub async fn announce(
    client: &Client,
    tracker: &str,
    request: &AnnounceRequest,
) -> Result<Vec<SocketAddr>> {
    let url = Url::parse(tracker)
        .map_err(|e| NodeError::Torrent(format!("bad tracker URL {}: {}", tracker, e)))?;

    match url.scheme() {
        "http" | "https" => announce_http(client, tracker, request).await,
        "udp" => announce_udp(&url, request).await,
        other => Err(NodeError::Torrent(format!(
            "unsupported tracker scheme {}",
            other
        ))),
    }
}

/// HTTP announce URL with the binary fields percent-encoded
pub fn announce_url(tracker: &str, request: &AnnounceRequest) -> String {
    let separator = if tracker.contains('?') { '&' } else { '?' };
    format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
        tracker,
        separator,
        urlencoding::encode_binary(&request.info_hash),
        urlencoding::encode_binary(&request.peer_id),
        ANNOUNCE_PORT,
        request.left
    )
}

async fn announce_http(
    client: &Client,
    tracker: &str,
    request: &AnnounceRequest,
) -> Result<Vec<SocketAddr>> {
    let url = announce_url(tracker, request);
    let stream = get_stream(client, &url).await?;
    let body = collect_limited(stream, tracker, MAX_RESPONSE_LEN).await?;
    parse_http_response(&body)
}

/// Peers from a bencoded tracker reply, compact or dictionary form
pub fn parse_http_response(body: &[u8]) -> Result<Vec<SocketAddr>> {
    let reply = Bencode::decode(body)?;
    if let Some(reason) = reply.get("failure reason").and_then(Bencode::as_str) {
        return Err(NodeError::Torrent(format!("tracker refused: {}", reason)));
    }

    match reply.get("peers") {
        Some(Bencode::Bytes(compact)) => parse_compact(compact),
        Some(Bencode::List(entries)) => Ok(entries
            .iter()
            .filter_map(|entry| {
                let ip = entry.get("ip")?.as_str()?.parse().ok()?;
                let port = u16::try_from(entry.get("port")?.as_int()?).ok()?;
                Some(SocketAddr::new(ip, port))
            })
            .collect()),
        _ => Ok(Vec::new()),
    }
}

/// BEP 23 compact peers: 4 address bytes and 2 port bytes each
fn parse_compact(data: &[u8]) -> Result<Vec<SocketAddr>> {
    if data.len() % 6 != 0 {
        return Err(NodeError::Torrent(format!(
            "compact peer list of {} bytes",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .filter(|addr| addr.port() != 0)
        .collect())
}

async fn announce_udp(url: &Url, request: &AnnounceRequest) -> Result<Vec<SocketAddr>> {
    let host = url
        .host_str()
        .ok_or_else(|| NodeError::Torrent(format!("tracker {} has no host", url)))?;
    let port = url
        .port()
        .ok_or_else(|| NodeError::Torrent(format!("tracker {} has no port", url)))?;
    let io = |e: std::io::Error| NodeError::transport(format!("tracker {}: {}", url, e));

    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(io)?;
    socket.connect((host, port)).await.map_err(io)?;

    let transaction: u32 = rand::random();
    let mut connect = BytesMut::with_capacity(16);
    connect.put_u64(UDP_PROTOCOL_ID);
    connect.put_u32(0);
    connect.put_u32(transaction);
    let reply = udp_exchange(&socket, &connect, url).await?;
    let mut cursor = &reply[..];
    expect_reply(&mut cursor, 0, transaction, 16, url)?;
    let connection_id = cursor.get_u64();

    let transaction: u32 = rand::random();
    let mut announce = BytesMut::with_capacity(98);
    announce.put_u64(connection_id);
    announce.put_u32(1);
    announce.put_u32(transaction);
    announce.put_slice(&request.info_hash);
    announce.put_slice(&request.peer_id);
    announce.put_u64(0); // downloaded
    announce.put_u64(request.left);
    announce.put_u64(0); // uploaded
    announce.put_u32(2); // started
    announce.put_u32(0); // our address, as seen by the tracker
    announce.put_u32(rand::random()); // key
    announce.put_i32(-1); // as many peers as it likes
    announce.put_u16(ANNOUNCE_PORT);
    let reply = udp_exchange(&socket, &announce, url).await?;
    let mut cursor = &reply[..];
    expect_reply(&mut cursor, 1, transaction, 20, url)?;
    cursor.advance(12); // interval, leechers, seeders

    parse_compact(cursor)
}

async fn udp_exchange(socket: &UdpSocket, packet: &[u8], url: &Url) -> Result<Vec<u8>> {
    socket
        .send(packet)
        .await
        .map_err(|e| NodeError::transport(format!("tracker {}: {}", url, e)))?;

    let mut buf = vec![0u8; 2048];
    let n = tokio::time::timeout(UDP_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| NodeError::transport(format!("tracker {}: no reply", url)))?
        .map_err(|e| NodeError::transport(format!("tracker {}: {}", url, e)))?;
    buf.truncate(n);
    Ok(buf)
}

/// Check action and transaction id, leaving `reply` just past them
fn expect_reply(
    reply: &mut &[u8],
    action: u32,
    transaction: u32,
    min_len: usize,
    url: &Url,
) -> Result<()> {
    if reply.len() < 8 {
        return Err(NodeError::Torrent(format!("tracker {}: short reply", url)));
    }
    let got_action = reply.get_u32();
    let got_transaction = reply.get_u32();
    if got_transaction != transaction {
        return Err(NodeError::Torrent(format!(
            "tracker {}: transaction mismatch",
            url
        )));
    }
    if got_action == 3 {
        return Err(NodeError::Torrent(format!(
            "tracker refused: {}",
            String::from_utf8_lossy(&reply[..])
        )));
    }
    if got_action != action || reply.len() + 8 < min_len {
        return Err(NodeError::Torrent(format!("tracker {}: unexpected reply", url)));
    }
    Ok(())
}
