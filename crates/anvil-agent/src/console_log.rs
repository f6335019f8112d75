use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::{Mutex, mpsc},
};

use crate::config::LogLimits;

pub const CONSOLE_LOG_FILE: &str = "console.log";
const MAX_TAIL_BYTES: u64 = 1024 * 1024;

/// In-memory ring of recent console lines, sequence-numbered so pollers can resume.
#[derive(Debug)]
pub struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }

    /// Cursor 0 returns the most recent `limit` lines.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }
}

/// Appends lines to a file, rotating to `.1`, `.2`, ... once `max_bytes` would be exceeded.
pub struct FileLogWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    bytes: u64,
    file: tokio::fs::File,
}

impl FileLogWriter {
    pub async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            max_bytes,
            max_files,
            bytes,
            file,
        })
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush().await;

        for i in (1..self.max_files).rev() {
            let from = PathBuf::from(format!("{}.{}", self.path.display(), i));
            let to = PathBuf::from(format!("{}.{}", self.path.display(), i + 1));
            if tokio::fs::metadata(&from).await.is_ok() {
                let _ = tokio::fs::rename(from, to).await;
            }
        }

        let rotated = PathBuf::from(format!("{}.1", self.path.display()));
        if tokio::fs::metadata(&self.path).await.is_ok() {
            let _ = tokio::fs::rename(&self.path, &rotated).await;
        }

        self.file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.bytes = 0;
        Ok(())
    }

    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let write_len = line.len() as u64;
        if self.max_bytes > 0 && self.bytes.saturating_add(write_len) > self.max_bytes {
            self.rotate().await.ok();
        }

        self.file.write_all(line.as_bytes()).await?;
        self.bytes = self.bytes.saturating_add(write_len);
        Ok(())
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush().await
    }
}

/// Fan-out for one workload's console: ring buffer plus a background file writer.
#[derive(Clone)]
pub struct LogSink {
    buffer: Arc<Mutex<LogBuffer>>,
    file_tx: Option<mpsc::UnboundedSender<String>>,
}

impl LogSink {
    pub fn memory_only(max_lines: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(LogBuffer::new(max_lines))),
            file_tx: None,
        }
    }

    /// Opens `<dir>/console.log` and spawns the writer task. Falls back to memory-only if the
    /// file cannot be opened.
    pub async fn open(dir: &Path, limits: &LogLimits) -> Self {
        let mut sink = Self::memory_only(limits.max_lines);
        let path = dir.join(CONSOLE_LOG_FILE);
        match FileLogWriter::open(path.clone(), limits.file_max_bytes, limits.file_max_files).await
        {
            Ok(mut writer) => {
                let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                tokio::spawn(async move {
                    while let Some(line) = rx.recv().await {
                        if writer.write_line(&line).await.is_err() {
                            break;
                        }
                        if rx.is_empty() {
                            let _ = writer.flush().await;
                        }
                    }
                    let _ = writer.flush().await;
                });
                sink.file_tx = Some(tx);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "console log file unavailable");
            }
        }
        sink
    }

    pub async fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        self.buffer.lock().await.push_line(line.clone());
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(line);
        }
    }

    pub async fn tail(&self, limit: usize) -> Vec<String> {
        self.buffer.lock().await.tail_after(0, limit).0
    }

    pub async fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.buffer.lock().await.tail_after(cursor, limit)
    }

    pub async fn last_seq(&self) -> u64 {
        self.buffer.lock().await.last_seq()
    }
}

/// Splits a byte window into lines, keeping only the last `max_lines`. Invalid UTF-8 is replaced.
pub fn split_lines_from_tail(buf: &[u8], max_lines: usize) -> Vec<String> {
    let text = String::from_utf8_lossy(buf);
    let mut out: Vec<String> = text.lines().map(|l| l.to_string()).collect();

    if out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }

    if out.len() > max_lines {
        out.drain(0..(out.len() - max_lines));
    }
    out
}

/// Reads roughly the last `max_lines` lines of a file. A missing file yields no lines.
pub async fn tail_file(path: &Path, max_lines: usize) -> std::io::Result<Vec<String>> {
    let size = match tokio::fs::metadata(path).await {
        Ok(m) => m.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    // ~200 bytes per console line is generous for game servers.
    let window = (max_lines as u64).saturating_mul(200).clamp(4096, MAX_TAIL_BYTES);
    let start = size.saturating_sub(window);

    let mut f = tokio::fs::File::open(path).await?;
    f.seek(std::io::SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((size - start) as usize);
    f.read_to_end(&mut buf).await?;

    let mut lines = split_lines_from_tail(&buf, max_lines.saturating_add(1));
    // A window that starts mid-file begins with a partial line.
    if start > 0 && lines.len() > max_lines {
        lines.remove(0);
    }
    if lines.len() > max_lines {
        lines.drain(0..(lines.len() - max_lines));
    }
    Ok(lines)
}

/// Reads complete lines appended since `cursor` (a byte offset). A file that shrank is read
/// from the start again.
pub async fn read_since(path: &Path, cursor: u64) -> std::io::Result<(Vec<String>, u64)> {
    let size = match tokio::fs::metadata(path).await {
        Ok(m) => m.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let cursor = if cursor > size { 0 } else { cursor };
    let to_read = (size - cursor).min(MAX_TAIL_BYTES);
    if to_read == 0 {
        return Ok((Vec::new(), cursor));
    }

    let mut f = tokio::fs::File::open(path).await?;
    f.seek(std::io::SeekFrom::Start(cursor)).await?;
    let mut buf = vec![0u8; to_read as usize];
    f.read_exact(&mut buf).await?;

    let complete = buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    let lines = split_lines_from_tail(&buf[..complete], usize::MAX);
    Ok((lines, cursor + complete as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::test_support::temp_dir_for;

    #[test]
    fn buffer_drops_oldest_lines() {
        let mut buf = LogBuffer::new(3);
        for i in 0..5 {
            buf.push_line(format!("line {i}"));
        }
        let (lines, last) = buf.tail_after(0, 10);
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(last, 5);

        let (lines, last) = buf.tail_after(3, 10);
        assert_eq!(lines, vec!["line 3", "line 4"]);
        assert_eq!(last, 5);
    }

    #[test]
    fn split_lines_keeps_tail() {
        let lines = split_lines_from_tail(b"a\nb\nc\n", 2);
        assert_eq!(lines, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn writer_rotates_when_full() {
        let dir = temp_dir_for("console-rotate");
        let path = dir.join(CONSOLE_LOG_FILE);
        let mut w = FileLogWriter::open(path.clone(), 16, 2).await.unwrap();
        w.write_line("0123456789").await.unwrap();
        w.write_line("abcdefghij").await.unwrap();
        w.flush().await.unwrap();

        let current = std::fs::read_to_string(&path).unwrap();
        let rotated = std::fs::read_to_string(format!("{}.1", path.display())).unwrap();
        assert_eq!(current, "abcdefghij\n");
        assert_eq!(rotated, "0123456789\n");
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn tail_and_incremental_reads() {
        let dir = temp_dir_for("console-tail");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONSOLE_LOG_FILE);
        std::fs::write(&path, "one\ntwo\nthree\npart").unwrap();

        assert_eq!(tail_file(&path, 2).await.unwrap(), vec!["three", "part"]);

        let (lines, cursor) = read_since(&path, 0).await.unwrap();
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert_eq!(cursor, 14);

        std::fs::write(&path, "one\ntwo\nthree\npartial done\n").unwrap();
        let (lines, _) = read_since(&path, cursor).await.unwrap();
        assert_eq!(lines, vec!["partial done"]);

        assert!(tail_file(&dir.join("missing.log"), 5).await.unwrap().is_empty());
        std::fs::remove_dir_all(dir).ok();
    }
}
