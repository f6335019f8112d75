//! Remote-console client (Source RCON framing, as spoken by Minecraft servers).
//!
//! Packet: `i32 len | i32 id | i32 type | body | 0 | 0`, little-endian, where `len` counts
//! everything after itself.

use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::error::{Result, RuntimeError};

const CHANNEL: &str = "rcon";

const TYPE_AUTH: i32 = 3;
const TYPE_AUTH_RESPONSE: i32 = 2;
const TYPE_EXEC: i32 = 2;
const TYPE_RESPONSE: i32 = 0;

const MAX_PACKET: usize = 4096 + 14;
/// Responses longer than this were likely split into several packets.
const FRAGMENT_HINT: usize = 4000;
const DEFAULT_RCON_PORT: u16 = 25575;

const PASSWORD_KEYS: &[&str] = &["RCON_PASSWORD", "RCON_PASS", "MC_RCON_PASSWORD"];
const PORT_KEYS: &[&str] = &["RCON_PORT", "MC_RCON_PORT"];

#[derive(Clone, PartialEq, Eq)]
pub struct RconSettings {
    pub port: u16,
    pub password: String,
}

impl std::fmt::Debug for RconSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RconSettings")
            .field("port", &self.port)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Reads remote-console settings from a workload environment. `None` when disabled or when no
/// password is configured.
pub fn settings_from_env(env: &BTreeMap<String, String>) -> Option<RconSettings> {
    if env
        .get("ENABLE_RCON")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("false"))
    {
        return None;
    }
    let password = PASSWORD_KEYS
        .iter()
        .find_map(|k| env.get(*k).map(|v| v.trim()).filter(|v| !v.is_empty()))?
        .to_string();
    let port = PORT_KEYS
        .iter()
        .find_map(|k| env.get(*k).and_then(|v| v.trim().parse::<u16>().ok()))
        .filter(|p| *p != 0)
        .unwrap_or(DEFAULT_RCON_PORT);
    Some(RconSettings { port, password })
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Packet {
    id: i32,
    kind: i32,
    body: String,
}

fn encode(id: i32, kind: i32, body: &str) -> Vec<u8> {
    let len = (4 + 4 + body.len() + 2) as i32;
    let mut out = Vec::with_capacity(len as usize + 4);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(&[0, 0]);
    out
}

async fn read_packet(stream: &mut TcpStream) -> Result<Packet> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| RuntimeError::protocol(CHANNEL, format!("read length: {e}")))?;
    let len = i32::from_le_bytes(len_buf);
    if !(10..=MAX_PACKET as i32).contains(&len) {
        return Err(RuntimeError::protocol(
            CHANNEL,
            format!("invalid packet length {len}"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| RuntimeError::protocol(CHANNEL, format!("read packet: {e}")))?;

    let id = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let kind = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let body_end = buf.len().saturating_sub(2).max(8);
    let body = String::from_utf8_lossy(&buf[8..body_end])
        .trim_end_matches('\0')
        .to_string();
    Ok(Packet { id, kind, body })
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| RuntimeError::ProtocolTimeout {
            channel: CHANNEL,
            timeout_ms: timeout.as_millis() as u64,
        })?
}

pub struct RconClient {
    stream: TcpStream,
    next_id: i32,
    timeout: Duration,
}

impl RconClient {
    pub async fn connect(addr: SocketAddr, password: &str, timeout: Duration) -> Result<Self> {
        let stream = with_timeout(timeout, async {
            TcpStream::connect(addr)
                .await
                .map_err(|e| RuntimeError::protocol(CHANNEL, format!("connect {addr}: {e}")))
        })
        .await?;
        let mut client = Self {
            stream,
            next_id: 1,
            timeout,
        };
        client.authenticate(password).await?;
        Ok(client)
    }

    async fn authenticate(&mut self, password: &str) -> Result<()> {
        let id = self.bump_id();
        let timeout = self.timeout;
        let stream = &mut self.stream;
        with_timeout(timeout, async move {
            stream
                .write_all(&encode(id, TYPE_AUTH, password))
                .await
                .map_err(|e| RuntimeError::protocol(CHANNEL, format!("send auth: {e}")))?;
            loop {
                let p = read_packet(stream).await?;
                // Some servers send an empty response packet before the auth result.
                if p.kind != TYPE_AUTH_RESPONSE {
                    continue;
                }
                if p.id == -1 {
                    return Err(RuntimeError::protocol(CHANNEL, "authentication rejected"));
                }
                if p.id == id {
                    return Ok(());
                }
            }
        })
        .await
    }

    fn bump_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    pub async fn command(&mut self, text: &str) -> Result<String> {
        let id = self.bump_id();
        let timeout = self.timeout;
        let stream = &mut self.stream;
        with_timeout(timeout, async move {
            stream
                .write_all(&encode(id, TYPE_EXEC, text))
                .await
                .map_err(|e| RuntimeError::protocol(CHANNEL, format!("send command: {e}")))?;
            let mut out = String::new();
            loop {
                let p = read_packet(stream).await?;
                if p.id != id || p.kind != TYPE_RESPONSE {
                    continue;
                }
                let fragment_len = p.body.len();
                out.push_str(&p.body);
                if fragment_len < FRAGMENT_HINT {
                    return Ok(out);
                }
                // Long responses continue in further packets; stop at the first quiet gap.
                match tokio::time::timeout(Duration::from_millis(150), read_packet(stream)).await {
                    Ok(Ok(next)) if next.id == id && next.kind == TYPE_RESPONSE => {
                        out.push_str(&next.body);
                        if next.body.len() < FRAGMENT_HINT {
                            return Ok(out);
                        }
                    }
                    _ => return Ok(out),
                }
            }
        })
        .await
    }
}

/// Connects, authenticates, runs one command and disconnects.
pub async fn execute(
    addr: SocketAddr,
    password: &str,
    command: &str,
    timeout: Duration,
) -> Result<String> {
    let mut client = RconClient::connect(addr, password, timeout).await?;
    client.command(command).await
}
