//! BitTorrent peer wire protocol (BEP 3), download side only
//!
//! A [`PeerConnection`] performs the handshake, declares interest and then
//! fetches whole pieces block by block. We never upload and never announce
//! pieces of our own.

use crate::error::{NodeError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

const PROTOCOL: &[u8] = b"BitTorrent protocol";
const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// Request size every client accepts
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Outstanding block requests per connection
const PIPELINE_DEPTH: usize = 5;

/// Largest message we accept: a block plus its header, or a large bitfield
const MAX_MESSAGE_LEN: usize = 1 << 20;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Silence from a peer longer than this drops the connection
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// A peer wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    /// Extension messages we do not speak
    Other(u8),
}

impl Message {
    /// Payload without the length prefix
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::KeepAlive => {}
            Message::Choke => buf.put_u8(0),
            Message::Unchoke => buf.put_u8(1),
            Message::Interested => buf.put_u8(2),
            Message::NotInterested => buf.put_u8(3),
            Message::Have(index) => {
                buf.put_u8(4);
                buf.put_u32(*index);
            }
            Message::Bitfield(bits) => {
                buf.put_u8(5);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.put_u8(6);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                buf.put_u8(7);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u8(8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Other(id) => buf.put_u8(*id),
        }
        buf.freeze()
    }

    /// Parse one frame payload
    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let id = frame.get_u8();
        let need = |frame: &Bytes, len: usize| {
            if frame.remaining() < len {
                Err(NodeError::transport(format!("truncated peer message {}", id)))
            } else {
                Ok(())
            }
        };

        Ok(match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                need(&frame, 4)?;
                Message::Have(frame.get_u32())
            }
            5 => Message::Bitfield(frame),
            6 | 8 => {
                need(&frame, 12)?;
                let (index, begin, length) = (frame.get_u32(), frame.get_u32(), frame.get_u32());
                if id == 6 {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            7 => {
                need(&frame, 8)?;
                let index = frame.get_u32();
                let begin = frame.get_u32();
                Message::Piece {
                    index,
                    begin,
                    block: frame,
                }
            }
            other => Message::Other(other),
        })
    }
}

/// The fixed 68-byte handshake
pub fn handshake(info_hash: &[u8; 20], peer_id: &[u8; 20]) -> [u8; 68] {
    let mut out = [0u8; HANDSHAKE_LEN];
    out[0] = PROTOCOL.len() as u8;
    out[1..20].copy_from_slice(PROTOCOL);
    // 8 reserved bytes stay zero: no extensions
    out[28..48].copy_from_slice(info_hash);
    out[48..68].copy_from_slice(peer_id);
    out
}

fn framing() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_MESSAGE_LEN)
        .new_codec()
}

/// An unchoked connection to one seeder
pub struct PeerConnection {
    addr: SocketAddr,
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    choked: bool,
    have: Vec<bool>,
}

impl PeerConnection {
    /// Connect, handshake and wait until the peer unchokes us
    pub async fn connect(
        addr: SocketAddr,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
        piece_count: usize,
    ) -> Result<Self> {
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| NodeError::transport(format!("peer {}: connect timed out", addr)))?
            .map_err(|e| NodeError::transport(format!("peer {}: {}", addr, e)))?;

        let exchange = async {
            stream.write_all(&handshake(info_hash, peer_id)).await?;
            let mut reply = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut reply).await?;
            Ok::<_, std::io::Error>(reply)
        };
        let reply = tokio::time::timeout(MESSAGE_TIMEOUT, exchange)
            .await
            .map_err(|_| NodeError::transport(format!("peer {}: handshake timed out", addr)))?
            .map_err(|e| NodeError::transport(format!("peer {}: handshake failed: {}", addr, e)))?;

        if reply[0] as usize != PROTOCOL.len() || &reply[1..20] != PROTOCOL {
            return Err(NodeError::transport(format!(
                "peer {}: not a BitTorrent peer",
                addr
            )));
        }
        if &reply[28..48] != info_hash {
            return Err(NodeError::transport(format!(
                "peer {}: serves a different torrent",
                addr
            )));
        }

        let mut peer = Self {
            addr,
            framed: Framed::new(stream, framing()),
            choked: true,
            have: vec![false; piece_count],
        };
        peer.send(Message::Interested).await?;
        while peer.choked {
            let message = peer.receive().await?;
            peer.observe(&message);
        }
        log::debug!("Peer {} unchoked us", addr);
        Ok(peer)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.have.get(index as usize).copied().unwrap_or(false)
    }

    /// Fetch piece `index` of `length` bytes; the caller checks its hash
    pub async fn download_piece(&mut self, index: u32, length: u32) -> Result<Vec<u8>> {
        if !self.has_piece(index) {
            return Err(self.error(format!("does not have piece {}", index)));
        }

        let mut piece = vec![0u8; length as usize];
        let mut pending: VecDeque<(u32, u32)> = (0..length)
            .step_by(BLOCK_SIZE as usize)
            .map(|begin| (begin, BLOCK_SIZE.min(length - begin)))
            .collect();
        let mut in_flight: Vec<(u32, u32)> = Vec::with_capacity(PIPELINE_DEPTH);
        let mut remaining = pending.len();

        while remaining > 0 {
            if !self.choked {
                while in_flight.len() < PIPELINE_DEPTH {
                    let Some((begin, len)) = pending.pop_front() else {
                        break;
                    };
                    self.send(Message::Request {
                        index,
                        begin,
                        length: len,
                    })
                    .await?;
                    in_flight.push((begin, len));
                }
            }

            match self.receive().await? {
                Message::Piece {
                    index: got,
                    begin,
                    block,
                } if got == index => {
                    let Some(pos) = in_flight
                        .iter()
                        .position(|(b, len)| *b == begin && *len as usize == block.len())
                    else {
                        continue;
                    };
                    in_flight.swap_remove(pos);
                    let start = begin as usize;
                    piece[start..start + block.len()].copy_from_slice(&block);
                    remaining -= 1;
                }
                Message::Choke => {
                    // Choking discards our outstanding requests
                    self.choked = true;
                    pending.extend(in_flight.drain(..));
                }
                other => self.observe(&other),
            }
        }

        Ok(piece)
    }

    fn observe(&mut self, message: &Message) {
        match message {
            Message::Choke => self.choked = true,
            Message::Unchoke => self.choked = false,
            Message::Have(index) => {
                if let Some(slot) = self.have.get_mut(*index as usize) {
                    *slot = true;
                }
            }
            Message::Bitfield(bits) => {
                for (i, slot) in self.have.iter_mut().enumerate() {
                    *slot = bits
                        .get(i / 8)
                        .is_some_and(|byte| byte & (0x80 >> (i % 8)) != 0);
                }
            }
            _ => {}
        }
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        let addr = self.addr;
        self.framed
            .send(message.encode())
            .await
            .map_err(|e| NodeError::transport(format!("peer {}: {}", addr, e)))
    }

    async fn receive(&mut self) -> Result<Message> {
        let frame = tokio::time::timeout(MESSAGE_TIMEOUT, self.framed.next())
            .await
            .map_err(|_| self.error("timed out".to_string()))?
            .ok_or_else(|| self.error("closed the connection".to_string()))?
            .map_err(|e| self.error(e.to_string()))?;
        Message::decode(frame.freeze())
    }

    fn error(&self, cause: String) -> NodeError {
        NodeError::transport(format!("peer {}: {}", self.addr, cause))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    /// A seeder holding `payload`; records every requested piece index
    pub(crate) struct FakeSeeder {
        pub(crate) addr: SocketAddr,
        pub(crate) requested: Arc<Mutex<Vec<u32>>>,
    }

    impl FakeSeeder {
        /// `corrupt` flips a byte in every block it sends
        pub(crate) async fn start(
            info_hash: [u8; 20],
            payload: Vec<u8>,
            piece_length: u32,
            corrupt: bool,
        ) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let requested = Arc::new(Mutex::new(Vec::new()));
            let log = requested.clone();
            let payload = Arc::new(payload);

            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let payload = payload.clone();
                    let log = log.clone();
                    tokio::spawn(async move {
                        let mut hello = [0u8; HANDSHAKE_LEN];
                        if socket.read_exact(&mut hello).await.is_err() || hello[28..48] != info_hash {
                            return;
                        }
                        let reply = handshake(&info_hash, &[b's'; 20]);
                        if socket.write_all(&reply).await.is_err() {
                            return;
                        }

                        let pieces = payload.len().div_ceil(piece_length as usize);
                        let mut framed = Framed::new(socket, framing());
                        let bits = Bytes::from(vec![0xffu8; pieces.div_ceil(8)]);
                        let _ = framed.send(Message::Bitfield(bits).encode()).await;
                        let _ = framed.send(Message::Unchoke.encode()).await;

                        while let Some(Ok(frame)) = framed.next().await {
                            if let Ok(Message::Request {
                                index,
                                begin,
                                length,
                            }) = Message::decode(frame.freeze())
                            {
                                log.lock().unwrap().push(index);
                                let start = index as usize * piece_length as usize + begin as usize;
                                let mut block = payload[start..start + length as usize].to_vec();
                                if corrupt {
                                    block[0] ^= 0xff;
                                }
                                let piece = Message::Piece {
                                    index,
                                    begin,
                                    block: Bytes::from(block),
                                };
                                if framed.send(piece.encode()).await.is_err() {
                                    return;
                                }
                            }
                        }
                    });
                }
            });

            Self { addr, requested }
        }

        pub(crate) fn requested(&self) -> Vec<u32> {
            let mut pieces = self.requested.lock().unwrap().clone();
            pieces.dedup();
            pieces
        }
    }

    #[test]
    fn test_message_encoding() {
        let request = Message::Request {
            index: 3,
            begin: 16384,
            length: 16384,
        };
        let bytes = request.encode();
        assert_eq!(bytes.len(), 13);
        assert_eq!(bytes[0], 6);
        assert_eq!(Message::decode(bytes).unwrap(), request);

        assert_eq!(Message::decode(Bytes::new()).unwrap(), Message::KeepAlive);
        assert_eq!(Message::decode(Bytes::from_static(&[20, 0])).unwrap(), Message::Other(20));
    }

    #[test]
    fn test_truncated_message_is_rejected() {
        assert!(Message::decode(Bytes::from_static(&[4, 0, 0])).is_err());
        assert!(Message::decode(Bytes::from_static(&[7, 0, 0, 0, 1])).is_err());
    }

    #[test]
    fn test_handshake_layout() {
        let bytes = handshake(&[1; 20], &[2; 20]);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0; 8]);
        assert_eq!(&bytes[28..48], &[1; 20]);
        assert_eq!(&bytes[48..68], &[2; 20]);
    }

    #[tokio::test]
    async fn test_download_piece_across_blocks() {
        // Three blocks, the last one short
        let piece_length = BLOCK_SIZE * 2 + 100;
        let payload: Vec<u8> = (0..piece_length * 2).map(|i| (i % 251) as u8).collect();
        let seeder = FakeSeeder::start([7; 20], payload.clone(), piece_length, false).await;

        let mut peer = PeerConnection::connect(seeder.addr, &[7; 20], &[1; 20], 2)
            .await
            .unwrap();
        assert!(peer.has_piece(1));
        assert!(!peer.has_piece(2));

        let piece = peer.download_piece(1, piece_length).await.unwrap();
        assert_eq!(piece, &payload[piece_length as usize..]);
        assert_eq!(seeder.requested(), vec![1]);
    }

    #[tokio::test]
    async fn test_wrong_info_hash_is_refused() {
        let seeder = FakeSeeder::start([7; 20], vec![0; 10], 16, false).await;
        assert!(PeerConnection::connect(seeder.addr, &[8; 20], &[1; 20], 1)
            .await
            .is_err());
    }
}
