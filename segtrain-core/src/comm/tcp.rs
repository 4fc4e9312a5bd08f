//! TCP process group: rank 0 is the hub, every other rank holds one
//! connection to it. Frames are length-delimited and start with an op byte
//! and a last-chunk flag; a message larger than [`CHUNK_LEN`] spans several
//! frames.

use crate::error::{Result, SegTrainError};
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

type Link = Framed<TcpStream, LengthDelimitedCodec>;

/// Payload bytes carried by one frame.
pub const CHUNK_LEN: usize = 1 << 20;
const HEADER_LEN: usize = 2;

fn framed(stream: TcpStream) -> Link {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(CHUNK_LEN + HEADER_LEN)
        .new_codec();
    Framed::new(stream, codec)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Op {
    Hello = 0,
    Barrier = 1,
    AllReduce = 2,
    Broadcast = 3,
    Gather = 4,
}

impl Op {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Op::Hello),
            1 => Some(Op::Barrier),
            2 => Some(Op::AllReduce),
            3 => Some(Op::Broadcast),
            4 => Some(Op::Gather),
            _ => None,
        }
    }
}

enum Links {
    /// Connections to ranks `1..world_size`, in rank order.
    Hub(Vec<Link>),
    Member(Link),
}

pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    links: Mutex<Links>,
}

/// `tcp://host:port` or `host:port`.
pub fn parse_dist_url(url: &str) -> Result<String> {
    let addr = url.strip_prefix("tcp://").unwrap_or(url);
    if addr.rsplit_once(':').is_none_or(|(host, port)| host.is_empty() || port.parse::<u16>().is_err()) {
        return Err(SegTrainError::distributed(format!(
            "invalid dist_url '{url}', expected tcp://host:port"
        )));
    }
    Ok(addr.to_string())
}

impl TcpGroup {
    /// Join the group at `dist_url`; rank 0 listens, the others connect with
    /// retries until `timeout` elapses.
    pub async fn connect(
        dist_url: &str,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        if rank >= world_size {
            return Err(SegTrainError::distributed(format!(
                "rank {rank} out of range for world size {world_size}"
            )));
        }
        let addr = parse_dist_url(dist_url)?;
        let links = if rank == 0 {
            let listener = TcpListener::bind(&addr).await.map_err(|e| {
                SegTrainError::distributed(format!("failed to listen on {addr}: {e}"))
            })?;
            tracing::info!(%addr, world_size, "waiting for workers to join");
            tokio::time::timeout(timeout, accept_members(listener, world_size))
                .await
                .map_err(|_| {
                    SegTrainError::distributed(format!(
                        "timed out after {timeout:?} waiting for {} workers",
                        world_size - 1
                    ))
                })??
        } else {
            let mut link = connect_with_retry(&addr, timeout).await?;
            send(&mut link, Op::Hello, &(rank as u32).to_le_bytes()).await?;
            Links::Member(link)
        };
        tracing::debug!(rank, world_size, "joined process group");
        Ok(Self {
            rank,
            world_size,
            links: Mutex::new(links),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub async fn barrier(&self) -> Result<()> {
        let mut links = self.links.lock().await;
        match &mut *links {
            Links::Hub(members) => {
                for link in members.iter_mut() {
                    recv(link, Op::Barrier).await?;
                }
                for link in members.iter_mut() {
                    send(link, Op::Barrier, &[]).await?;
                }
            }
            Links::Member(link) => {
                send(link, Op::Barrier, &[]).await?;
                recv(link, Op::Barrier).await?;
            }
        }
        Ok(())
    }

    pub async fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()> {
        let mut links = self.links.lock().await;
        match &mut *links {
            Links::Hub(members) => {
                let mut sum: Vec<f64> = values.iter().map(|&v| v as f64).collect();
                for link in members.iter_mut() {
                    let payload = recv(link, Op::AllReduce).await?;
                    let theirs = decode_f32s(&payload)?;
                    if theirs.len() != sum.len() {
                        return Err(SegTrainError::distributed(format!(
                            "all_reduce length mismatch: {} vs {}",
                            theirs.len(),
                            sum.len()
                        )));
                    }
                    for (acc, v) in sum.iter_mut().zip(theirs) {
                        *acc += v as f64;
                    }
                }
                let n = self.world_size as f64;
                for (out, acc) in values.iter_mut().zip(sum) {
                    *out = (acc / n) as f32;
                }
                let encoded = encode_f32s(values);
                for link in members.iter_mut() {
                    send(link, Op::AllReduce, &encoded).await?;
                }
            }
            Links::Member(link) => {
                send(link, Op::AllReduce, &encode_f32s(values)).await?;
                let reduced = decode_f32s(&recv(link, Op::AllReduce).await?)?;
                if reduced.len() != values.len() {
                    return Err(SegTrainError::distributed("all_reduce reply has wrong length"));
                }
                values.copy_from_slice(&reduced);
            }
        }
        Ok(())
    }

    pub async fn broadcast(&self, data: Bytes) -> Result<Bytes> {
        let mut links = self.links.lock().await;
        match &mut *links {
            Links::Hub(members) => {
                for link in members.iter_mut() {
                    send(link, Op::Broadcast, &data).await?;
                }
                Ok(data)
            }
            Links::Member(link) => recv(link, Op::Broadcast).await,
        }
    }

    pub async fn gather(&self, data: Bytes) -> Result<Vec<Bytes>> {
        let mut links = self.links.lock().await;
        match &mut *links {
            Links::Hub(members) => {
                let mut out = Vec::with_capacity(self.world_size);
                out.push(data);
                for link in members.iter_mut() {
                    out.push(recv(link, Op::Gather).await?);
                }
                Ok(out)
            }
            Links::Member(link) => {
                send(link, Op::Gather, &data).await?;
                Ok(Vec::new())
            }
        }
    }
}

async fn accept_members(listener: TcpListener, world_size: usize) -> Result<Links> {
    let mut slots: Vec<Option<Link>> = (1..world_size).map(|_| None).collect();
    let mut joined = 0;
    while joined < slots.len() {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let mut link = framed(stream);
        let hello = recv(&mut link, Op::Hello).await?;
        let rank = hello
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| SegTrainError::distributed("malformed hello frame"))?
            as usize;
        let slot = rank
            .checked_sub(1)
            .and_then(|i| slots.get_mut(i))
            .ok_or_else(|| SegTrainError::distributed(format!("unexpected rank {rank} from {peer}")))?;
        if slot.is_some() {
            return Err(SegTrainError::distributed(format!("rank {rank} joined twice")));
        }
        *slot = Some(link);
        joined += 1;
        tracing::debug!(rank, %peer, "worker joined");
    }
    Ok(Links::Hub(slots.into_iter().flatten().collect()))
}

async fn connect_with_retry(addr: &str, timeout: Duration) -> Result<Link> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(framed(stream));
            }
            Err(e) if tokio::time::Instant::now() < deadline => {
                tracing::trace!(%addr, error = %e, "rank 0 not reachable yet");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => {
                return Err(SegTrainError::distributed(format!(
                    "could not reach rank 0 at {addr} within {timeout:?}: {e}"
                )));
            }
        }
    }
}

async fn send(link: &mut Link, op: Op, payload: &[u8]) -> Result<()> {
    let failed = |e: std::io::Error| SegTrainError::distributed(format!("send {op:?} failed: {e}"));
    let chunks = payload.len().div_ceil(CHUNK_LEN).max(1);
    for i in 0..chunks {
        let start = i * CHUNK_LEN;
        let chunk = &payload[start..payload.len().min(start + CHUNK_LEN)];
        let mut frame = BytesMut::with_capacity(chunk.len() + HEADER_LEN);
        frame.put_u8(op as u8);
        frame.put_u8(u8::from(i + 1 == chunks));
        frame.put_slice(chunk);
        link.feed(frame.freeze()).await.map_err(failed)?;
    }
    SinkExt::<Bytes>::flush(link).await.map_err(failed)
}

async fn recv(link: &mut Link, expected: Op) -> Result<Bytes> {
    let mut message = BytesMut::new();
    loop {
        let frame = link
            .next()
            .await
            .ok_or_else(|| SegTrainError::distributed("peer closed the connection"))?
            .map_err(|e| SegTrainError::distributed(format!("receive failed: {e}")))?;
        let op = frame.first().copied().and_then(Op::from_byte);
        if op != Some(expected) {
            return Err(SegTrainError::distributed(format!(
                "expected {expected:?} frame, got {op:?}"
            )));
        }
        let last = frame
            .get(1)
            .copied()
            .ok_or_else(|| SegTrainError::distributed("truncated frame header"))?;
        if last != 0 && message.is_empty() {
            return Ok(frame.freeze().slice(HEADER_LEN..));
        }
        message.extend_from_slice(&frame[HEADER_LEN..]);
        if last != 0 {
            return Ok(message.freeze());
        }
    }
}

fn encode_f32s(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_f32s(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(SegTrainError::distributed("f32 payload length is not a multiple of 4"));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
