//! Append-only per-job log files and incremental tailing.
//!
//! Every raw line the agent process emits is appended verbatim to
//! `{log_dir}/{job_id}.log`. Readers poll with a byte offset; the offset
//! only ever advances past complete lines, so a write that lands mid-line
//! between two polls is never surfaced half-finished.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::errors::EngineError;

/// Writer half. One per running job, append mode, flushed per line so a
/// tail sees output as it happens.
pub struct JobLog {
    path: PathBuf,
    file: File,
}

impl JobLog {
    pub async fn create(log_dir: &Path, job_id: &str) -> Result<Self, EngineError> {
        tokio::fs::create_dir_all(log_dir)
            .await
            .map_err(|e| EngineError::LogOpenFailed {
                path: log_dir.to_path_buf(),
                source: e,
            })?;
        let path = log_dir.join(format!("{}.log", job_id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| EngineError::LogOpenFailed {
                path: path.clone(),
                source: e,
            })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append_line(&mut self, line: &str) -> std::io::Result<()> {
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.file.flush().await
    }
}

/// One incremental read of a job log.
#[derive(Debug, PartialEq)]
pub struct TailChunk {
    /// Complete lines read since the given offset.
    pub lines: Vec<String>,
    /// Offset to pass on the next poll.
    pub next_offset: u64,
    /// Set when the file shrank under the reader (rotation or deletion and
    /// recreation); the read restarted from the beginning.
    pub truncated: bool,
}

/// Read complete lines from `offset` onward. Bytes after the last newline
/// are left for the next poll. An `offset` that lands mid-line skips
/// forward to the next line boundary, so a fragment of a split line is
/// never surfaced. If the file is shorter than `offset`, the file was
/// truncated since the last poll and the read restarts at zero.
pub async fn tail(path: &Path, offset: u64) -> std::io::Result<TailChunk> {
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();

    let (start, truncated) = if offset > len { (0, true) } else { (offset, false) };

    // The byte before `start` tells us whether we are sitting on a line
    // boundary.
    let mid_line = if start > 0 {
        file.seek(SeekFrom::Start(start - 1)).await?;
        let mut prev = [0u8; 1];
        file.read_exact(&mut prev).await?;
        prev[0] != b'\n'
    } else {
        false
    };

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf).await?;

    // Skip the remainder of the split line. Until its newline arrives
    // there is nothing whole to report.
    let skipped = if mid_line {
        match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None => {
                return Ok(TailChunk {
                    lines: Vec::new(),
                    next_offset: start,
                    truncated,
                })
            }
        }
    } else {
        0
    };
    let body = &buf[skipped..];

    // Advance only past the last complete line.
    let end = match body.iter().rposition(|&b| b == b'\n') {
        Some(pos) => pos + 1,
        None => 0,
    };
    let mut lines: Vec<String> = body[..end]
        .split(|&b| b == b'\n')
        .map(|l| String::from_utf8_lossy(l).into_owned())
        .collect();
    // The piece after the final newline is always empty; drop it. With no
    // complete line at all, the single empty piece goes the same way.
    lines.pop();

    Ok(TailChunk {
        lines,
        next_offset: start + (skipped + end) as u64,
        truncated,
    })
}

/// Read at most the last `max_bytes` of a log as complete lines. When the
/// file is larger, the skipped prefix is replaced by a notice line and the
/// chunk is flagged truncated.
pub async fn tail_last(path: &Path, max_bytes: u64) -> std::io::Result<TailChunk> {
    let len = tokio::fs::metadata(path).await?.len();
    if len <= max_bytes {
        return tail(path, 0).await;
    }
    let mut chunk = tail(path, len - max_bytes).await?;
    chunk.lines.insert(
        0,
        format!("[log truncated, showing the last {} bytes]", max_bytes),
    );
    chunk.truncated = true;
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_tail() {
        let dir = TempDir::new().unwrap();
        let mut log = JobLog::create(dir.path(), "widget-7-plan").await.unwrap();
        log.append_line("first").await.unwrap();
        log.append_line("second").await.unwrap();

        let chunk = tail(log.path(), 0).await.unwrap();
        assert_eq!(chunk.lines, vec!["first", "second"]);
        assert!(!chunk.truncated);

        // Nothing new: same offset comes back.
        let again = tail(log.path(), chunk.next_offset).await.unwrap();
        assert!(again.lines.is_empty());
        assert_eq!(again.next_offset, chunk.next_offset);
    }

    #[tokio::test]
    async fn test_tail_stops_at_partial_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("j.log");
        tokio::fs::write(&path, b"done\nhalf").await.unwrap();

        let chunk = tail(&path, 0).await.unwrap();
        assert_eq!(chunk.lines, vec!["done"]);
        assert_eq!(chunk.next_offset, 5);

        // Completing the line makes it visible on the next poll.
        tokio::fs::write(&path, b"done\nhalfway\n").await.unwrap();
        let chunk = tail(&path, chunk.next_offset).await.unwrap();
        assert_eq!(chunk.lines, vec!["halfway"]);
    }

    #[tokio::test]
    async fn test_tail_detects_truncation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("j.log");
        tokio::fs::write(&path, b"a long line of output\n").await.unwrap();
        let chunk = tail(&path, 0).await.unwrap();

        tokio::fs::write(&path, b"new\n").await.unwrap();
        let chunk = tail(&path, chunk.next_offset).await.unwrap();
        assert!(chunk.truncated);
        assert_eq!(chunk.lines, vec!["new"]);
        assert_eq!(chunk.next_offset, 4);
    }

    #[tokio::test]
    async fn test_tail_mid_line_offset_skips_to_next_boundary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("j.log");
        tokio::fs::write(&path, b"hello\nworld\n").await.unwrap();

        // Offset 4 lands inside "hello"; its fragment must not leak out.
        let chunk = tail(&path, 4).await.unwrap();
        assert_eq!(chunk.lines, vec!["world"]);
        assert_eq!(chunk.next_offset, 12);
    }

    #[tokio::test]
    async fn test_tail_mid_line_offset_waits_for_the_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("j.log");
        tokio::fs::write(&path, b"hello wor").await.unwrap();

        let chunk = tail(&path, 4).await.unwrap();
        assert!(chunk.lines.is_empty());
        assert_eq!(chunk.next_offset, 4);
    }

    #[tokio::test]
    async fn test_tail_last_caps_bytes_and_prepends_notice() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("j.log");
        tokio::fs::write(&path, b"first line\nsecond line\nthird line\n")
            .await
            .unwrap();

        let chunk = tail_last(&path, 15).await.unwrap();
        assert!(chunk.truncated);
        assert_eq!(chunk.lines.len(), 2);
        assert!(chunk.lines[0].starts_with("[log truncated"));
        assert_eq!(chunk.lines[1], "third line");

        // A cap larger than the file reads everything, no notice.
        let whole = tail_last(&path, 4096).await.unwrap();
        assert!(!whole.truncated);
        assert_eq!(whole.lines, vec!["first line", "second line", "third line"]);
    }

    #[tokio::test]
    async fn test_log_path_uses_job_id() {
        let dir = TempDir::new().unwrap();
        let log = JobLog::create(dir.path(), "widget-7-plan").await.unwrap();
        assert!(log.path().ends_with("widget-7-plan.log"));
    }
}
