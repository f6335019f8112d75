//! Minecraft server-list ping: handshake (next state = status), status request, JSON reply.

use std::{net::SocketAddr, time::Duration};

use serde::Deserialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::error::{Result, RuntimeError};

const CHANNEL: &str = "status-query";
const MAX_RESPONSE: usize = 1024 * 1024;
/// Any protocol version works for the status state; servers answer regardless.
const PROTOCOL_VERSION: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub online: u32,
    pub max: u32,
    pub names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StatusJson {
    #[serde(default)]
    players: Option<PlayersJson>,
}

#[derive(Debug, Deserialize)]
struct PlayersJson {
    #[serde(default)]
    max: u32,
    #[serde(default)]
    online: u32,
    #[serde(default)]
    sample: Vec<SampleJson>,
}

#[derive(Debug, Deserialize)]
struct SampleJson {
    #[serde(default)]
    name: String,
}

fn write_varint(out: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7f == 0 {
            out.push(v as u8);
            return;
        }
        out.push(((v & 0x7f) | 0x80) as u8);
        v >>= 7;
    }
}

async fn read_varint(stream: &mut TcpStream) -> Result<i32> {
    let mut value: u32 = 0;
    for i in 0..5 {
        let b = stream
            .read_u8()
            .await
            .map_err(|e| RuntimeError::protocol(CHANNEL, format!("read varint: {e}")))?;
        value |= ((b & 0x7f) as u32) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(RuntimeError::protocol(CHANNEL, "varint too long"))
}

fn frame(packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(packet.len() + 5);
    write_varint(&mut out, packet.len() as i32);
    out.extend_from_slice(packet);
    out
}

fn handshake(host: &str, port: u16) -> Vec<u8> {
    let mut p = Vec::new();
    write_varint(&mut p, 0x00);
    write_varint(&mut p, PROTOCOL_VERSION);
    write_varint(&mut p, host.len() as i32);
    p.extend_from_slice(host.as_bytes());
    p.extend_from_slice(&port.to_be_bytes());
    write_varint(&mut p, 1);
    frame(&p)
}

fn parse_status(json: &str) -> Result<StatusReport> {
    let parsed: StatusJson = serde_json::from_str(json)
        .map_err(|e| RuntimeError::protocol(CHANNEL, format!("invalid status json: {e}")))?;
    let players = parsed
        .players
        .ok_or_else(|| RuntimeError::protocol(CHANNEL, "status reply has no players block"))?;
    let names = players
        .sample
        .into_iter()
        .map(|s| s.name.trim().to_string())
        // Servers that hide the list fill the sample with placeholder text.
        .filter(|n| !n.is_empty() && !n.contains(' ') && !n.starts_with('§'))
        .collect();
    Ok(StatusReport {
        online: players.online,
        max: players.max,
        names,
    })
}

async fn query_inner(addr: SocketAddr) -> Result<StatusReport> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| RuntimeError::protocol(CHANNEL, format!("connect {addr}: {e}")))?;

    let mut out = handshake(&addr.ip().to_string(), addr.port());
    out.extend_from_slice(&frame(&[0x00]));
    stream
        .write_all(&out)
        .await
        .map_err(|e| RuntimeError::protocol(CHANNEL, format!("send request: {e}")))?;

    let _packet_len = read_varint(&mut stream).await?;
    let packet_id = read_varint(&mut stream).await?;
    if packet_id != 0x00 {
        return Err(RuntimeError::protocol(
            CHANNEL,
            format!("unexpected packet id {packet_id}"),
        ));
    }
    let json_len = read_varint(&mut stream).await?;
    if json_len < 0 || json_len as usize > MAX_RESPONSE {
        return Err(RuntimeError::protocol(
            CHANNEL,
            format!("invalid status length {json_len}"),
        ));
    }
    let mut buf = vec![0u8; json_len as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| RuntimeError::protocol(CHANNEL, format!("read status: {e}")))?;
    parse_status(&String::from_utf8_lossy(&buf))
}

pub async fn query(addr: SocketAddr, timeout: Duration) -> Result<StatusReport> {
    tokio::time::timeout(timeout, query_inner(addr))
        .await
        .map_err(|_| RuntimeError::ProtocolTimeout {
            channel: CHANNEL,
            timeout_ms: timeout.as_millis() as u64,
        })?
}
