//! Torrent-descriptor transport
//!
//! Reads the release's `.torrent` file and selects the one file entry named
//! like the archive. Only the pieces overlapping that file are requested:
//! from peers found through the descriptor's trackers when it has any,
//! otherwise (or once every peer has failed) from its web seeds (BEP 19).

use super::downloader::{create_client, get_stream, get_stream_from, ArtifactStream, Transport};
use super::locator::ArtifactDescriptor;
use super::peer::PeerConnection;
use super::tracker::{announce, AnnounceRequest};
use crate::error::{NodeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::Client;
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use url::Url;

/// Nesting limit for bencoded values
const MAX_DEPTH: usize = 32;

/// Pieces larger than this are not fetched from peers
const MAX_PIECE_LENGTH: u64 = 64 * 1024 * 1024;

/// Peers tried per download
const MAX_PEERS: usize = 30;

/// Verified file slices buffered ahead of the consumer
const SWARM_BUFFER: usize = 4;

const PEER_ID_PREFIX: &str = "-BL0100-";

/// A decoded bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

impl Bencode {
    /// Decode exactly one value spanning all of `data`
    pub fn decode(data: &[u8]) -> Result<Self> {
        Self::decode_with_info(data).map(|(value, _)| value)
    }

    /// Decode, also returning where the top-level `info` value sits in `data`
    fn decode_with_info(data: &[u8]) -> Result<(Self, Option<Range<usize>>)> {
        let mut decoder = Decoder {
            data,
            pos: 0,
            info_span: None,
        };
        let value = decoder.value(0)?;
        if decoder.pos != data.len() {
            return Err(NodeError::Torrent(format!(
                "trailing data at byte {}",
                decoder.pos
            )));
        }
        Ok((value, decoder.info_span))
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Bencode> {
        match self {
            Bencode::Dict(map) => map.get(key.as_bytes()),
            _ => None,
        }
    }

    pub(crate) fn as_int(&self) -> Option<i64> {
        match self {
            Bencode::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub(crate) fn as_str(&self) -> Option<&str> {
        match self {
            Bencode::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub(crate) fn as_list(&self) -> Option<&[Bencode]> {
        match self {
            Bencode::List(items) => Some(items),
            _ => None,
        }
    }
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    info_span: Option<Range<usize>>,
}

impl Decoder<'_> {
    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| NodeError::Torrent("unexpected end of data".to_string()))
    }

    fn value(&mut self, depth: usize) -> Result<Bencode> {
        if depth > MAX_DEPTH {
            return Err(NodeError::Torrent("nesting too deep".to_string()));
        }

        match self.peek()? {
            b'i' => {
                self.pos += 1;
                let digits = self.until(b'e')?;
                let text = std::str::from_utf8(digits)
                    .map_err(|_| NodeError::Torrent("non-ascii integer".to_string()))?;
                text.parse()
                    .map(Bencode::Int)
                    .map_err(|_| NodeError::Torrent(format!("bad integer \"{}\"", text)))
            }
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Bencode::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut map = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = self.bytes()?;
                    let start = self.pos;
                    let value = self.value(depth + 1)?;
                    if depth == 0 && key == b"info" {
                        self.info_span = Some(start..self.pos);
                    }
                    map.insert(key, value);
                }
                self.pos += 1;
                Ok(Bencode::Dict(map))
            }
            b'0'..=b'9' => self.bytes().map(Bencode::Bytes),
            other => Err(NodeError::Torrent(format!(
                "unexpected byte 0x{:02x} at {}",
                other, self.pos
            ))),
        }
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let digits = self.until(b':')?;
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| NodeError::Torrent("bad string length".to_string()))?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| NodeError::Torrent("string runs past end of data".to_string()))?;
        let bytes = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    /// Bytes up to (not including) `delim`; consumes the delimiter
    fn until(&mut self, delim: u8) -> Result<&[u8]> {
        let rest = &self.data[self.pos..];
        let idx = rest
            .iter()
            .position(|b| *b == delim)
            .ok_or_else(|| NodeError::Torrent("unexpected end of data".to_string()))?;
        let start = self.pos;
        self.pos += idx + 1;
        Ok(&self.data[start..start + idx])
    }
}

/// One file listed in a torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path components below the torrent's root name
    pub path: Vec<String>,
    pub length: u64,
    /// Byte offset of this file in the concatenated torrent payload
    pub offset: u64,
}

impl TorrentFile {
    pub fn file_name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or("")
    }
}

/// The parts of a `.torrent` file the transport needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentDescriptor {
    pub name: String,
    /// SHA-1 of the bencoded `info` dictionary
    pub info_hash: [u8; 20],
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<TorrentFile>,
    /// Sum of all file lengths
    pub total_length: u64,
    /// `announce` followed by the `announce-list` tiers, without duplicates
    pub trackers: Vec<String>,
    pub web_seeds: Vec<String>,
    single_file: bool,
}

impl TorrentDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (root, info_span) = Bencode::decode_with_info(data)?;
        let info = root
            .get("info")
            .ok_or_else(|| NodeError::Torrent("missing info dictionary".to_string()))?;
        let info_hash = match info_span {
            Some(span) => sha1_of(&data[span]),
            None => return Err(NodeError::Torrent("missing info dictionary".to_string())),
        };

        let name = info
            .get("name")
            .and_then(Bencode::as_str)
            .ok_or_else(|| NodeError::Torrent("missing name".to_string()))?
            .to_string();

        let piece_length = info
            .get("piece length")
            .and_then(Bencode::as_int)
            .and_then(|n| u64::try_from(n).ok())
            .filter(|n| *n > 0)
            .ok_or_else(|| NodeError::Torrent("missing piece length".to_string()))?;

        let piece_hashes = match info.get("pieces") {
            Some(Bencode::Bytes(hashes)) => parse_piece_hashes(hashes)?,
            _ => Vec::new(),
        };

        let (files, total_length, single_file) =
            match info.get("files").and_then(Bencode::as_list) {
                Some(list) => {
                    let (files, total) = parse_files(list)?;
                    (files, total, false)
                }
                None => {
                    let length = info
                        .get("length")
                        .and_then(Bencode::as_int)
                        .and_then(|n| u64::try_from(n).ok())
                        .ok_or_else(|| NodeError::Torrent("missing length".to_string()))?;
                    let file = TorrentFile {
                        path: vec![name.clone()],
                        length,
                        offset: 0,
                    };
                    (vec![file], length, true)
                }
            };

        let web_seeds = match root.get("url-list") {
            Some(Bencode::List(items)) => items
                .iter()
                .filter_map(Bencode::as_str)
                .map(str::to_string)
                .collect(),
            Some(single) => single.as_str().map(|s| vec![s.to_string()]).unwrap_or_default(),
            None => Vec::new(),
        };

        Ok(Self {
            name,
            info_hash,
            piece_length,
            piece_hashes,
            files,
            total_length,
            trackers: parse_trackers(&root),
            web_seeds,
            single_file,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| NodeError::io(format!("Failed to read {}", path.display()), e))?;
        Self::parse(&data)
    }

    /// The single file named `filename`; zero or several matches is an error
    pub fn select(&self, filename: &str) -> Result<&TorrentFile> {
        let mut matching = self.files.iter().filter(|f| f.file_name() == filename);
        match (matching.next(), matching.next()) {
            (Some(file), None) => Ok(file),
            (None, _) => Err(NodeError::Torrent(format!("{} not listed", filename))),
            (Some(_), Some(_)) => Err(NodeError::Torrent(format!("{} listed more than once", filename))),
        }
    }

    /// Piece indices overlapping `file`
    pub fn pieces_for(&self, file: &TorrentFile) -> Range<u64> {
        if file.length == 0 {
            return 0..0;
        }
        let first = file.offset / self.piece_length;
        let last = (file.offset.saturating_add(file.length) - 1) / self.piece_length;
        first..last + 1
    }

    /// True when piece hashes cover the payload, so peers can be used
    pub fn supports_peers(&self) -> bool {
        self.piece_length <= MAX_PIECE_LENGTH
            && !self.piece_hashes.is_empty()
            && self.piece_hashes.len() as u64 == self.total_length.div_ceil(self.piece_length)
    }

    /// Length of piece `index`; only the last one may be short
    pub fn piece_len(&self, index: u64) -> u64 {
        let start = index.saturating_mul(self.piece_length);
        self.piece_length.min(self.total_length.saturating_sub(start))
    }

    pub fn verify_piece(&self, index: u64, data: &[u8]) -> bool {
        self.piece_hashes
            .get(index as usize)
            .is_some_and(|expected| sha1_of(data) == *expected)
    }

    /// The part of piece `index` that belongs to `file`
    pub fn file_slice<'a>(&self, file: &TorrentFile, index: u64, piece: &'a [u8]) -> &'a [u8] {
        let piece_start = index.saturating_mul(self.piece_length);
        let piece_end = piece_start.saturating_add(piece.len() as u64);
        let start = piece_start.max(file.offset);
        let end = piece_end.min(file.offset.saturating_add(file.length));
        if start >= end {
            return &[];
        }
        &piece[(start - piece_start) as usize..(end - piece_start) as usize]
    }

    /// Web seed URLs for `file`, in descriptor order
    pub fn seed_urls(&self, file: &TorrentFile) -> Vec<String> {
        self.web_seeds
            .iter()
            .filter_map(|seed| self.seed_url(seed, file))
            .collect()
    }

    fn seed_url(&self, seed: &str, file: &TorrentFile) -> Option<String> {
        if self.single_file && !seed.ends_with('/') {
            return Some(seed.to_string());
        }

        let mut url = Url::parse(seed).ok()?;
        {
            let mut segments = url.path_segments_mut().ok()?;
            segments.pop_if_empty();
            if self.single_file {
                segments.push(&self.name);
            } else {
                segments.push(&self.name);
                segments.extend(file.path.iter());
            }
        }
        Some(url.to_string())
    }
}

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&Sha1::digest(data));
    hash
}

fn parse_piece_hashes(data: &[u8]) -> Result<Vec<[u8; 20]>> {
    if data.len() % 20 != 0 {
        return Err(NodeError::Torrent(format!(
            "pieces is {} bytes, not a multiple of 20",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

fn parse_trackers(root: &Bencode) -> Vec<String> {
    let mut trackers = Vec::new();
    if let Some(url) = root.get("announce").and_then(Bencode::as_str) {
        trackers.push(url.to_string());
    }
    let tiers = root.get("announce-list").and_then(Bencode::as_list).unwrap_or(&[]);
    for tier in tiers {
        for url in tier.as_list().unwrap_or(&[]).iter().filter_map(Bencode::as_str) {
            if !trackers.iter().any(|t| t == url) {
                trackers.push(url.to_string());
            }
        }
    }
    trackers
}

/// File entries with their payload offsets, and the payload length
fn parse_files(list: &[Bencode]) -> Result<(Vec<TorrentFile>, u64)> {
    let mut offset = 0u64;
    let mut files = Vec::with_capacity(list.len());

    for entry in list {
        let length = entry
            .get("length")
            .and_then(Bencode::as_int)
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| NodeError::Torrent("file entry without length".to_string()))?;
        let path = entry
            .get("path")
            .and_then(Bencode::as_list)
            .map(|parts| parts.iter().filter_map(Bencode::as_str).map(str::to_string).collect::<Vec<_>>())
            .filter(|parts| !parts.is_empty())
            .ok_or_else(|| NodeError::Torrent("file entry without path".to_string()))?;

        files.push(TorrentFile {
            path,
            length,
            offset,
        });
        offset = offset
            .checked_add(length)
            .ok_or_else(|| NodeError::Torrent("file offsets overflow".to_string()))?;
    }

    Ok((files, offset))
}

/// Streams one archive out of a local torrent descriptor
pub struct TorrentTransport {
    descriptor_path: PathBuf,
    client: Client,
    peer_id: [u8; 20],
}

impl TorrentTransport {
    pub fn new(descriptor_path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            descriptor_path: descriptor_path.into(),
            client: create_client()?,
            peer_id: random_peer_id(),
        })
    }

    /// Ask every tracker for peers; a failing tracker is only logged
    async fn find_peers(&self, descriptor: &TorrentDescriptor, file: &TorrentFile) -> Vec<SocketAddr> {
        if descriptor.trackers.is_empty() {
            return Vec::new();
        }
        if !descriptor.supports_peers() {
            log::debug!(
                "{} has no usable piece hashes; not contacting peers",
                self.descriptor_path.display()
            );
            return Vec::new();
        }

        let request = AnnounceRequest {
            info_hash: descriptor.info_hash,
            peer_id: self.peer_id,
            left: file.length,
        };
        let mut seen = HashSet::new();
        let mut peers = Vec::new();
        for tracker in &descriptor.trackers {
            match announce(&self.client, tracker, &request).await {
                Ok(found) => {
                    log::debug!("Tracker {} returned {} peer(s)", tracker, found.len());
                    peers.extend(found.into_iter().filter(|peer| seen.insert(*peer)));
                }
                Err(e) => log::warn!("Tracker {} failed: {}", tracker, e),
            }
            if peers.len() >= MAX_PEERS {
                break;
            }
        }
        peers.truncate(MAX_PEERS);
        peers
    }

    /// Stream the whole file from the first web seed that serves it
    async fn open_web_seed(&self, urls: &[String], file: &TorrentFile) -> Result<ArtifactStream> {
        let mut last_error = None;
        for url in urls {
            match get_stream(&self.client, url).await {
                Ok(stream) => {
                    if let Some(len) = stream.total_len {
                        if len != file.length {
                            log::warn!("Seed {} reports {} bytes, expected {}", url, len, file.length);
                            last_error = Some(NodeError::transport(format!(
                                "{} served {} bytes, expected {}",
                                url, len, file.length
                            )));
                            continue;
                        }
                    }
                    return Ok(ArtifactStream {
                        total_len: Some(file.length),
                        body: stream.body,
                    });
                }
                Err(e) => {
                    log::warn!("Seed {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| NodeError::transport("no web seed answered")))
    }
}

fn random_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX.as_bytes());
    let mut rng = rand::thread_rng();
    for byte in &mut id[PEER_ID_PREFIX.len()..] {
        *byte = rng.sample(Alphanumeric);
    }
    id
}

#[async_trait]
impl Transport for TorrentTransport {
    fn name(&self) -> &'static str {
        "torrent"
    }

    async fn open(&self, artifact: &ArtifactDescriptor) -> Result<ArtifactStream> {
        let descriptor = TorrentDescriptor::load(&self.descriptor_path)?;
        let file = descriptor.select(&artifact.filename)?.clone();

        let pieces = descriptor.pieces_for(&file);
        log::info!(
            "Selected {} ({} bytes, pieces {}..{}); skipping {} other files",
            artifact.filename,
            file.length,
            pieces.start,
            pieces.end,
            descriptor.files.len() - 1
        );

        let seeds = descriptor.seed_urls(&file);
        let peers = self.find_peers(&descriptor, &file).await;
        if peers.is_empty() {
            if seeds.is_empty() {
                return Err(NodeError::Torrent(format!(
                    "{} has no reachable peers or usable web seeds",
                    self.descriptor_path.display()
                )));
            }
            return self.open_web_seed(&seeds, &file).await;
        }

        log::info!("Fetching {} from {} peer(s)", artifact.filename, peers.len());
        let total_len = Some(file.length);
        let swarm = Swarm {
            descriptor,
            file,
            peers,
            seeds,
            peer_id: self.peer_id,
            client: self.client.clone(),
        };
        let (tx, rx) = mpsc::channel(SWARM_BUFFER);
        tokio::spawn(swarm.run(tx));

        let body = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(ArtifactStream { total_len, body })
    }
}

/// Piece-by-piece download of one file, peers first, web seeds last
struct Swarm {
    descriptor: TorrentDescriptor,
    file: TorrentFile,
    peers: Vec<SocketAddr>,
    seeds: Vec<String>,
    peer_id: [u8; 20],
    client: Client,
}

/// How far the download has got
struct Cursor {
    next_piece: u64,
    end_piece: u64,
    /// Bytes of the file already handed to the consumer
    delivered: u64,
}

impl Swarm {
    async fn run(self, tx: mpsc::Sender<Result<Bytes>>) {
        let pieces = self.descriptor.pieces_for(&self.file);
        let mut cursor = Cursor {
            next_piece: pieces.start,
            end_piece: pieces.end,
            delivered: 0,
        };

        for addr in &self.peers {
            if cursor.next_piece >= cursor.end_piece || tx.is_closed() {
                return;
            }
            if let Err(e) = self.from_peer(*addr, &mut cursor, &tx).await {
                log::warn!("{}; trying the next source", e);
            }
        }
        if cursor.next_piece >= cursor.end_piece || tx.is_closed() {
            return;
        }

        if let Err(e) = self.from_web_seeds(cursor.delivered, &tx).await {
            let _ = tx.send(Err(e)).await;
        }
    }

    async fn from_peer(
        &self,
        addr: SocketAddr,
        cursor: &mut Cursor,
        tx: &mpsc::Sender<Result<Bytes>>,
    ) -> Result<()> {
        let descriptor = &self.descriptor;
        let mut peer = PeerConnection::connect(
            addr,
            &descriptor.info_hash,
            &self.peer_id,
            descriptor.piece_hashes.len(),
        )
        .await?;

        while cursor.next_piece < cursor.end_piece {
            let index = u32::try_from(cursor.next_piece)
                .map_err(|_| NodeError::Torrent("piece index out of range".to_string()))?;
            let length = u32::try_from(descriptor.piece_len(cursor.next_piece))
                .map_err(|_| NodeError::Torrent("piece too large".to_string()))?;

            let piece = peer.download_piece(index, length).await?;
            if !descriptor.verify_piece(cursor.next_piece, &piece) {
                return Err(NodeError::transport(format!(
                    "peer {}: piece {} failed its hash check",
                    peer.addr(),
                    index
                )));
            }

            let slice = descriptor.file_slice(&self.file, cursor.next_piece, &piece);
            if tx.send(Ok(Bytes::copy_from_slice(slice))).await.is_err() {
                // Consumer gave up
                return Ok(());
            }
            cursor.delivered += slice.len() as u64;
            cursor.next_piece += 1;
        }
        Ok(())
    }

    /// Continue from byte `offset` of the file using the web seeds
    async fn from_web_seeds(&self, offset: u64, tx: &mpsc::Sender<Result<Bytes>>) -> Result<()> {
        if self.seeds.is_empty() {
            return Err(NodeError::transport(
                "every peer failed and the descriptor lists no web seeds",
            ));
        }

        let mut last_error = None;
        for url in &self.seeds {
            match get_stream_from(&self.client, url, offset).await {
                Ok(mut stream) => {
                    log::info!("Continuing from web seed {} at byte {}", url, offset);
                    while let Some(chunk) = stream.body.next().await {
                        let failed = chunk.is_err();
                        if tx.send(chunk).await.is_err() || failed {
                            break;
                        }
                    }
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Seed {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| NodeError::transport("no web seed answered")))
    }
}
