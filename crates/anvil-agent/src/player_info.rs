//! Online-player resolution across several query strategies.

use std::{net::SocketAddr, time::Duration};

use anvil_model::{PlayerInfo, PlayerInfoSource, ServerInstance};
use async_trait::async_trait;

use crate::backend::Backend;
use crate::dispatch::CommandDispatcher;
use crate::error::{Result, RuntimeError};
use crate::status_query;

const SCRAPE_DELAY: Duration = Duration::from_millis(500);
const SCRAPE_TAIL: usize = 50;
const LOG_SCAN_TAIL: usize = 2000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerSample {
    pub online: u32,
    pub max: Option<u32>,
    pub names: Vec<String>,
}

/// One stage of the fallback chain. `Ok(None)` means the stage does not apply.
#[async_trait]
pub trait PlayerSource: Send + Sync {
    fn stage(&self) -> PlayerInfoSource;
    async fn sample(&self) -> Result<Option<PlayerSample>>;
}

/// Walks the stages in order until one yields names. Counts merge monotonically: a later stage
/// can raise the reported count but never lower it.
pub async fn resolve(stages: &[Box<dyn PlayerSource + '_>]) -> PlayerInfo {
    let mut info: Option<PlayerInfo> = None;

    for stage in stages {
        let source = stage.stage();
        let sample = match stage.sample().await {
            Ok(Some(s)) => s,
            Ok(None) => continue,
            Err(e) => {
                tracing::debug!(stage = ?source, error = %e, "player stage failed");
                continue;
            }
        };

        let merged = info.get_or_insert_with(|| PlayerInfo {
            online: 0,
            max: None,
            names: Vec::new(),
            source,
            names_source: None,
        });
        merged.online = merged.online.max(sample.online);
        if merged.max.is_none() {
            merged.max = sample.max;
        }
        if !sample.names.is_empty() {
            merged.online = merged.online.max(sample.names.len() as u32);
            merged.names = sample.names;
            merged.names_source = Some(source);
            break;
        }
    }

    info.unwrap_or_else(PlayerInfo::unavailable)
}

fn strip_color_codes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '§' {
            chars.next();
            continue;
        }
        out.push(c);
    }
    out
}

fn trailing_number(s: &str) -> Option<u32> {
    let s = s.trim_end();
    let start = s
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + s[i..].chars().next().map_or(1, char::len_utf8))
        .unwrap_or(0);
    s[start..].parse().ok()
}

fn leading_number(s: &str) -> Option<u32> {
    let s = s.trim_start();
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..end].parse().ok()
}

/// Locates a count phrase in one line: `N of a max of M` or `N/M`. Returns the counts and the
/// byte offset where the phrase ends.
fn find_counts(line: &str) -> Option<(u32, u32, usize)> {
    const MAX_OF: &str = " of a max of ";
    if let Some(i) = line.find(MAX_OF) {
        let online = trailing_number(&line[..i])?;
        let rest = &line[i + MAX_OF.len()..];
        let max = leading_number(rest)?;
        return Some((online, max, i + MAX_OF.len()));
    }
    for (i, _) in line.match_indices('/') {
        let (Some(online), Some(max)) = (trailing_number(&line[..i]), leading_number(&line[i + 1..]))
        else {
            continue;
        };
        if line[..i].ends_with(char::is_whitespace) || line[i + 1..].starts_with(char::is_whitespace)
        {
            continue;
        }
        return Some((online, max, i + 1));
    }
    None
}

fn split_names(s: &str) -> Vec<String> {
    s.split(',')
        .map(|n| n.trim().trim_end_matches('.').trim())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses a `list` command response. Only the last line carrying a count is used, so scraped
/// console output with several responses reports the newest.
pub fn parse_list_response(text: &str) -> Option<PlayerSample> {
    let clean = strip_color_codes(text);
    let lines: Vec<&str> = clean.lines().collect();
    let (idx, (online, max, phrase_end)) = lines
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, l)| find_counts(l).map(|c| (i, c)))?;

    let line = lines[idx];
    let after_phrase = &line[phrase_end..];
    let mut names = match after_phrase.find(':') {
        Some(c) => split_names(&after_phrase[c + 1..]),
        None => Vec::new(),
    };
    // Some servers print the names on the following line.
    if names.is_empty() && online > 0 && after_phrase.trim_end().ends_with(':') {
        if let Some(&next) = lines.get(idx + 1) {
            let next = next.rsplit("]: ").next().unwrap_or(next);
            names = split_names(next);
        }
    }

    Some(PlayerSample {
        online,
        max: Some(max),
        names,
    })
}

fn name_before(line: &str, phrase: &str) -> Option<String> {
    let i = line.find(phrase)?;
    let token = line[..i].split_whitespace().last()?;
    let name = token.trim_matches(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'));
    (!name.is_empty()).then(|| name.to_string())
}

/// Reconstructs the online set from join/leave lines. A server-stopping line clears the set.
/// `None` when the log contains no relevant lines at all.
pub fn scan_log_for_players(lines: &[String]) -> Option<PlayerSample> {
    let mut online: Vec<String> = Vec::new();
    let mut seen = false;

    for raw in lines {
        let line = strip_color_codes(raw);
        if line.contains("Stopping server") || line.contains("Stopping the server") {
            online.clear();
            seen = true;
            continue;
        }
        if line.contains("Done (") && line.contains("For help") {
            seen = true;
            continue;
        }
        if let Some(name) = name_before(&line, " joined the game") {
            seen = true;
            if !online.contains(&name) {
                online.push(name);
            }
            continue;
        }
        let left = name_before(&line, " left the game")
            .or_else(|| name_before(&line, " lost connection"));
        if let Some(name) = left {
            seen = true;
            online.retain(|n| n != &name);
        }
    }

    seen.then(|| PlayerSample {
        online: online.len() as u32,
        max: None,
        names: online,
    })
}

/// Removes 8-byte multiplexed-stream headers (`[stream, 0, 0, 0, len_be32]`) when the buffer is
/// framed; unframed buffers are returned unchanged.
pub fn strip_stream_frames(buf: &[u8]) -> Vec<u8> {
    let looks_framed = |b: &[u8]| b.len() >= 8 && b[0] <= 2 && b[1] == 0 && b[2] == 0 && b[3] == 0;
    if !looks_framed(buf) {
        return buf.to_vec();
    }
    let mut out = Vec::with_capacity(buf.len());
    let mut rest = buf;
    while looks_framed(rest) {
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (8 + len).min(rest.len());
        out.extend_from_slice(&rest[8..end]);
        rest = &rest[end..];
    }
    out.extend_from_slice(rest);
    out
}

pub struct StatusQueryStage {
    pub addr: Option<SocketAddr>,
    pub timeout: Duration,
}

#[async_trait]
impl PlayerSource for StatusQueryStage {
    fn stage(&self) -> PlayerInfoSource {
        PlayerInfoSource::StatusQuery
    }

    async fn sample(&self) -> Result<Option<PlayerSample>> {
        let Some(addr) = self.addr else {
            return Ok(None);
        };
        let r = status_query::query(addr, self.timeout).await?;
        Ok(Some(PlayerSample {
            online: r.online,
            max: Some(r.max),
            names: r.names,
        }))
    }
}

/// Stages that issue the workload's list command over one dispatch tier.
pub struct ConsoleStage<'a> {
    pub source: PlayerInfoSource,
    pub backend: &'a dyn Backend,
    pub dispatcher: &'a CommandDispatcher,
    pub instance: &'a ServerInstance,
    pub command: &'a str,
}

#[async_trait]
impl PlayerSource for ConsoleStage<'_> {
    fn stage(&self) -> PlayerInfoSource {
        self.source
    }

    async fn sample(&self) -> Result<Option<PlayerSample>> {
        let text = match self.source {
            PlayerInfoSource::RemoteConsole => {
                match self
                    .dispatcher
                    .via_rcon(self.backend, self.instance, self.command)
                    .await?
                {
                    Some(t) => t,
                    None => return Ok(None),
                }
            }
            PlayerInfoSource::Attach => {
                self.dispatcher
                    .via_attach(self.backend, self.instance, self.command)
                    .await?
            }
            PlayerInfoSource::ProcessTable => {
                self.dispatcher
                    .via_process_table(self.backend, self.instance, self.command)
                    .await?;
                tokio::time::sleep(SCRAPE_DELAY).await;
                self.backend
                    .logs(self.instance.id.as_str(), SCRAPE_TAIL)
                    .await?
                    .join("\n")
            }
            other => {
                return Err(RuntimeError::Internal(format!(
                    "{other:?} is not a console stage"
                )));
            }
        };
        Ok(parse_list_response(&text))
    }
}

pub struct LogScanStage<'a> {
    pub backend: &'a dyn Backend,
    pub instance: &'a ServerInstance,
}

#[async_trait]
impl PlayerSource for LogScanStage<'_> {
    fn stage(&self) -> PlayerInfoSource {
        PlayerInfoSource::LogScan
    }

    async fn sample(&self) -> Result<Option<PlayerSample>> {
        let lines = self
            .backend
            .logs(self.instance.id.as_str(), LOG_SCAN_TAIL)
            .await?;
        Ok(scan_log_for_players(&lines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(PlayerInfoSource, Result<Option<PlayerSample>>);

    #[async_trait]
    impl PlayerSource for Fixed {
        fn stage(&self) -> PlayerInfoSource {
            self.0
        }

        async fn sample(&self) -> Result<Option<PlayerSample>> {
            match &self.1 {
                Ok(v) => Ok(v.clone()),
                Err(e) => Err(RuntimeError::Internal(e.to_string())),
            }
        }
    }

    fn sample(online: u32, names: &[&str]) -> PlayerSample {
        PlayerSample {
            online,
            max: Some(20),
            names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn parses_max_of_phrasing() {
        let s = parse_list_response("There are 2 of a max of 20 players online: Steve, Alex").unwrap();
        assert_eq!(s.online, 2);
        assert_eq!(s.max, Some(20));
        assert_eq!(s.names, vec!["Steve", "Alex"]);
    }

    #[test]
    fn parses_slash_phrasing_with_log_prefix() {
        let text = "[12:01:02] [Server thread/INFO]: There are 1/10 players online: Notch";
        let s = parse_list_response(text).unwrap();
        assert_eq!(s.online, 1);
        assert_eq!(s.max, Some(10));
        assert_eq!(s.names, vec!["Notch"]);
    }

    #[test]
    fn empty_server_and_garbage() {
        let s = parse_list_response("There are 0 of a max of 20 players online:").unwrap();
        assert_eq!(s.online, 0);
        assert!(s.names.is_empty());
        assert!(parse_list_response("Unknown command").is_none());
    }

    #[test]
    fn newest_response_wins_in_scraped_logs() {
        let text = "[INFO]: There are 1 of a max of 20 players online: A\n\
                    [INFO]: A joined\n\
                    [INFO]: There are 2 of a max of 20 players online: A, B";
        assert_eq!(parse_list_response(text).unwrap().names, vec!["A", "B"]);
    }

    #[test]
    fn log_scan_tracks_joins_and_resets() {
        let lines: Vec<String> = [
            "[10:00:00] [Server thread/INFO]: Steve joined the game",
            "[10:00:01] [Server thread/INFO]: Alex joined the game",
            "[10:00:02] [Server thread/INFO]: Stopping server",
            "[10:05:00] [Server thread/INFO]: Done (3.2s)! For help, type \"help\"",
            "[10:05:10] [Server thread/INFO]: Alex joined the game",
            "[10:05:11] [Server thread/INFO]: Herobrine joined the game",
            "[10:05:12] [Server thread/INFO]: Herobrine lost connection: Disconnected",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let s = scan_log_for_players(&lines).unwrap();
        assert_eq!(s.names, vec!["Alex"]);
        assert_eq!(s.online, 1);
        assert!(scan_log_for_players(&["nothing here".to_string()]).is_none());
    }

    #[test]
    fn strips_multiplexed_headers() {
        let mut framed = vec![1, 0, 0, 0, 0, 0, 0, 3];
        framed.extend_from_slice(b"abc");
        framed.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 2]);
        framed.extend_from_slice(b"de");
        assert_eq!(strip_stream_frames(&framed), b"abcde");
        assert_eq!(strip_stream_frames(b"plain text"), b"plain text");
    }

    #[tokio::test]
    async fn stops_at_first_stage_with_names_and_keeps_max_count() {
        let stages: Vec<Box<dyn PlayerSource>> = vec![
            Box::new(Fixed(PlayerInfoSource::StatusQuery, Ok(Some(sample(5, &[]))))),
            Box::new(Fixed(
                PlayerInfoSource::RemoteConsole,
                Err(RuntimeError::ProtocolTimeout {
                    channel: "rcon",
                    timeout_ms: 10,
                }),
            )),
            Box::new(Fixed(PlayerInfoSource::Attach, Ok(Some(sample(3, &["a", "b", "c"]))))),
            Box::new(Fixed(PlayerInfoSource::LogScan, Ok(Some(sample(9, &["z"]))))),
        ];
        let info = resolve(&stages).await;
        assert_eq!(info.online, 5);
        assert_eq!(info.names, vec!["a", "b", "c"]);
        assert_eq!(info.source, PlayerInfoSource::StatusQuery);
        assert_eq!(info.names_source, Some(PlayerInfoSource::Attach));
    }

    #[tokio::test]
    async fn count_never_decreases_across_stages() {
        let counts = [4u32, 2, 7, 1];
        let stages: Vec<Box<dyn PlayerSource>> = counts
            .iter()
            .map(|c| Box::new(Fixed(PlayerInfoSource::LogScan, Ok(Some(sample(*c, &[]))))) as Box<dyn PlayerSource>)
            .collect();
        let info = resolve(&stages).await;
        assert_eq!(info.online, 7);
        assert!(info.names.is_empty());
    }

    #[tokio::test]
    async fn nothing_available() {
        let stages: Vec<Box<dyn PlayerSource>> =
            vec![Box::new(Fixed(PlayerInfoSource::StatusQuery, Ok(None)))];
        let info = resolve(&stages).await;
        assert_eq!(info.source, PlayerInfoSource::Unavailable);
    }
}
