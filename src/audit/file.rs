//! File-backed audit recorder
//!
//! Events are appended as JSON Lines:
//! ```text
//! ~/.govshield/audit/
//! └── audit.jsonl
//! ```
//! Several processes (`serve`, `scan`, `report`) may share one log. An append
//! holds an exclusive lock on the file, folds in lines other writers added
//! since the last read and only then numbers its batch, so ids stay unique
//! across processes. Queries take a shared lock and catch up the same way.
//!
//! A failed write is truncated back to the previous end of file. A partial
//! line left by a crashed writer is terminated before the next append, so it
//! is skipped on load instead of swallowing the following event.

use crate::audit::recorder::{AuditRecorder, Clock, EventCursor, EventLog, SystemClock};
use crate::audit::types::{AuditEvent, EventId, EventType, NewEvent, TimeRange};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

struct FileState {
    log: EventLog,
    file: File,
    /// Bytes of the file already folded into `log`
    offset: u64,
}

/// Append-only JSON Lines recorder
pub struct FileRecorder {
    path: PathBuf,
    state: Arc<Mutex<FileState>>,
    clock: Arc<dyn Clock>,
}

impl FileRecorder {
    /// Open (or create) the log at `path`.
    pub async fn open(path: impl Into<PathBuf>, max_events: Option<usize>) -> Result<Self> {
        Self::open_with_clock(path, max_events, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(
        path: impl Into<PathBuf>,
        max_events: Option<usize>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let open_path = path.clone();
        let state = tokio::task::spawn_blocking(move || -> Result<FileState> {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&open_path)?;
            let mut log = EventLog::new(max_events);
            let mut offset = 0;
            {
                let _lock = FileLock::shared(&file)?;
                catch_up(&mut log, &file, &mut offset, &open_path)?;
            }
            Ok(FileState { log, file, offset })
        })
        .await
        .map_err(|e| Error::AuditWrite(format!("Audit open task failed: {}", e)))??;

        tracing::info!(
            path = %path.display(),
            loaded = state.log.len(),
            "Opened audit log"
        );

        Ok(Self {
            path,
            state: Arc::new(Mutex::new(state)),
            clock,
        })
    }

    /// Default log location (~/.govshield/audit/audit.jsonl)
    pub fn default_path() -> PathBuf {
        dirs_next::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".govshield")
            .join("audit")
            .join("audit.jsonl")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run blocking file work against the state on the blocking pool.
    async fn with_state<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut FileState) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::AuditWrite(format!("Audit task failed: {}", e)))?
    }
}

/// Advisory whole-file lock, released on drop
#[cfg_attr(not(unix), allow(dead_code))]
struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn exclusive(file: &'a File) -> std::io::Result<Self> {
        Self::acquire(file, true)
    }

    fn shared(file: &'a File) -> std::io::Result<Self> {
        Self::acquire(file, false)
    }

    #[cfg(unix)]
    fn acquire(file: &'a File, exclusive: bool) -> std::io::Result<Self> {
        use rustix::fs::{flock, FlockOperation};
        let operation = if exclusive {
            FlockOperation::LockExclusive
        } else {
            FlockOperation::LockShared
        };
        flock(file, operation)?;
        Ok(Self { file })
    }

    // No advisory locking here: the log is single-process on this platform.
    #[cfg(not(unix))]
    fn acquire(file: &'a File, _exclusive: bool) -> std::io::Result<Self> {
        Ok(Self { file })
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            let _ = rustix::fs::flock(self.file, rustix::fs::FlockOperation::Unlock);
        }
    }
}

/// Fold complete lines appended since `offset` into `log`.
///
/// Returns `true` when the file ends in a partial line.
fn catch_up(
    log: &mut EventLog,
    mut file: &File,
    offset: &mut u64,
    path: &Path,
) -> std::io::Result<bool> {
    file.seek(SeekFrom::Start(*offset))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let complete = data.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    let events = parse_lines(&data[..complete], path);
    if !events.is_empty() {
        let absorbed = log.absorb(events);
        tracing::debug!(path = %path.display(), absorbed, "Caught up audit log");
    }
    *offset += complete as u64;
    Ok(complete < data.len())
}

fn parse_lines(data: &[u8], path: &Path) -> Vec<AuditEvent> {
    let mut events = Vec::new();
    for line in data.split(|b| *b == b'\n') {
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match serde_json::from_slice::<AuditEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!("Skipping unreadable audit line in {}: {}", path.display(), e);
            }
        }
    }
    events
}

fn append_locked(
    state: &mut FileState,
    drafts: Vec<NewEvent>,
    clock: &dyn Clock,
    path: &Path,
) -> Result<Vec<EventId>> {
    let write_error =
        |e: std::io::Error| Error::AuditWrite(format!("Failed to append to {}: {}", path.display(), e));

    let FileState { log, file, offset } = state;
    let file: &File = file;
    let _lock = FileLock::exclusive(file).map_err(write_error)?;

    if catch_up(log, file, offset, path).map_err(write_error)? {
        tracing::warn!(
            path = %path.display(),
            "Terminating partial audit line left by an interrupted write"
        );
        let mut writer = file;
        writer.write_all(b"\n").map_err(write_error)?;
        catch_up(log, file, offset, path).map_err(write_error)?;
    }

    let prepared = log.prepare(drafts, clock.now())?;
    let mut buf = Vec::new();
    for event in &prepared {
        serde_json::to_writer(&mut buf, event)?;
        buf.push(b'\n');
    }

    let start = *offset;
    let mut writer = file;
    if let Err(e) = writer.write_all(&buf).and_then(|_| writer.flush()) {
        if let Err(truncate) = file.set_len(start) {
            tracing::warn!(
                path = %path.display(),
                error = %truncate,
                "Could not roll back partial audit write"
            );
        }
        return Err(write_error(e));
    }

    *offset = start + buf.len() as u64;
    Ok(log.commit(prepared))
}

#[async_trait]
impl AuditRecorder for FileRecorder {
    async fn record_batch(&self, events: Vec<NewEvent>) -> Result<Vec<EventId>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let clock = self.clock.clone();
        let path = self.path.clone();
        self.with_state(move |state| append_locked(state, events, clock.as_ref(), &path))
            .await
    }

    async fn query(&self, range: TimeRange, types: Option<&[EventType]>) -> Result<EventCursor> {
        let path = self.path.clone();
        let window = self
            .with_state(move |state| {
                let FileState { log, file, offset } = state;
                let file: &File = file;
                let _lock = FileLock::shared(file)?;
                catch_up(log, file, offset, &path)?;
                Ok(log.window(&range))
            })
            .await?;
        Ok(EventCursor::new(window, types))
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::types::EventDetail;
    use chrono::Utc;

    fn denied(principal: &str) -> NewEvent {
        NewEvent::new(
            EventType::AccessDenied,
            principal,
            EventDetail::Access {
                principal: principal.into(),
                resource: "bucket/pii".into(),
                permission: "write".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("audit.jsonl");

        {
            let recorder = FileRecorder::open(&path, None).await.unwrap();
            recorder.record(denied("alice")).await.unwrap();
            recorder.record(denied("bob")).await.unwrap();
        }

        let recorder = FileRecorder::open(&path, None).await.unwrap();
        let events = recorder
            .query(TimeRange::until(Utc::now()), None)
            .await
            .unwrap()
            .to_vec();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].subject, "alice");

        let next = recorder.record(denied("carol")).await.unwrap();
        assert!(next > events[1].event_id);
    }

    #[tokio::test]
    async fn test_corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        {
            let recorder = FileRecorder::open(&path, None).await.unwrap();
            recorder.record(denied("alice")).await.unwrap();
        }
        let mut data = tokio::fs::read_to_string(&path).await.unwrap();
        data.push_str("{not json}\n");
        tokio::fs::write(&path, data).await.unwrap();

        let recorder = FileRecorder::open(&path, None).await.unwrap();
        let cursor = recorder.query(TimeRange::until(Utc::now()), None).await.unwrap();
        assert_eq!(cursor.count(), 1);
    }

    #[tokio::test]
    async fn test_two_recorders_share_one_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let server = FileRecorder::open(&path, None).await.unwrap();
        let cli = FileRecorder::open(&path, None).await.unwrap();
        let a = server.record(denied("alice")).await.unwrap();
        let b = cli.record(denied("bob")).await.unwrap();
        let c = server.record(denied("carol")).await.unwrap();
        assert!(a < b && b < c);

        // each recorder sees the other's appends
        let seen: Vec<_> = server
            .query(TimeRange::until(Utc::now()), None)
            .await
            .unwrap()
            .iter()
            .map(|e| e.subject.clone())
            .collect();
        assert_eq!(seen, vec!["alice", "bob", "carol"]);
        assert_eq!(
            cli.query(TimeRange::until(Utc::now()), None).await.unwrap().count(),
            3
        );

        drop(server);
        drop(cli);
        let reloaded = FileRecorder::open(&path, None).await.unwrap();
        let events = reloaded
            .query(TimeRange::until(Utc::now()), None)
            .await
            .unwrap()
            .to_vec();
        assert_eq!(events.len(), 3);
        for pair in events.windows(2) {
            assert!(pair[0].event_id < pair[1].event_id);
        }
    }

    #[tokio::test]
    async fn test_partial_line_does_not_swallow_next_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let recorder = FileRecorder::open(&path, None).await.unwrap();
        recorder.record(denied("alice")).await.unwrap();

        // interrupted writer: half a line, no newline
        {
            use std::io::Write;
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(br#"{"event_id":99,"timest"#).unwrap();
        }

        recorder.record(denied("bob")).await.unwrap();
        drop(recorder);

        let reloaded = FileRecorder::open(&path, None).await.unwrap();
        let subjects: Vec<_> = reloaded
            .query(TimeRange::until(Utc::now()), None)
            .await
            .unwrap()
            .iter()
            .map(|e| e.subject.clone())
            .collect();
        assert_eq!(subjects, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_duplicate_id_on_disk_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let recorder = FileRecorder::open(&path, None).await.unwrap();
            recorder.record(denied("alice")).await.unwrap();
        }
        let line = tokio::fs::read_to_string(&path).await.unwrap();
        tokio::fs::write(&path, format!("{}{}", line, line)).await.unwrap();

        let recorder = FileRecorder::open(&path, None).await.unwrap();
        let next = recorder.record(denied("bob")).await.unwrap();
        let events = recorder
            .query(TimeRange::until(Utc::now()), None)
            .await
            .unwrap()
            .to_vec();
        assert_eq!(events.len(), 2);
        assert_eq!(next, EventId(2));
    }

    #[tokio::test]
    async fn test_capacity_applies_to_reloaded_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let recorder = FileRecorder::open(&path, None).await.unwrap();
            recorder.record(denied("a")).await.unwrap();
        }
        let recorder = FileRecorder::open(&path, Some(1)).await.unwrap();
        assert!(matches!(
            recorder.record(denied("b")).await,
            Err(Error::AuditWrite(_))
        ));
    }
}
