//! Result sinks: where every outcome of a batch ends up.
//!
//! A [`ResultSink`] is append-only and write-once per `(model, timestamp)`
//! key. Failures are returned, never swallowed, so the dispatcher can surface
//! them to the caller.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chorus_types::{ChorusError, Result, ResultRecord};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Store one record. Must be safe to call from concurrent tasks.
    async fn append(&self, record: ResultRecord) -> Result<()>;
}

fn duplicate_key(record: &ResultRecord) -> ChorusError {
    ChorusError::Sink(format!(
        "record for model '{}' at '{}' already exists",
        record.model, record.timestamp
    ))
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    records: Vec<ResultRecord>,
    keys: HashSet<(String, String)>,
}

/// In-process sink, mostly for tests and dry runs.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything appended so far, in append order.
    pub fn records(&self) -> Vec<ResultRecord> {
        self.state
            .lock()
            .map(|s| s.records.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn append(&self, record: ResultRecord) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ChorusError::Sink("memory sink lock poisoned".into()))?;
        let key = (record.model.clone(), record.timestamp.clone());
        if !state.keys.insert(key) {
            return Err(duplicate_key(&record));
        }
        state.records.push(record);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonlSink
// ---------------------------------------------------------------------------

/// Append-only JSON-lines file, one [`ResultRecord`] per line.
///
/// A record cut short by a crash mid-append can only ever be the last line.
/// Reads skip it and the next writer truncates it away, so earlier records
/// stay readable.
pub struct JsonlSink {
    path: PathBuf,
    state: tokio::sync::Mutex<JsonlState>,
}

struct JsonlState {
    keys: HashSet<(String, String)>,
    /// The file does not end in a newline; the next append starts with one.
    needs_newline: bool,
    /// A write failed part way; repair the tail before the next append.
    dirty: bool,
}

impl JsonlSink {
    /// Open (or create) the file at `path`, creating parent directories and
    /// loading the keys already stored so duplicates are rejected across runs.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let stored = repair_tail(&path).await?;
        let keys = stored
            .records
            .into_iter()
            .map(|r| (r.model, r.timestamp))
            .collect::<HashSet<_>>();
        tracing::debug!(path = %path.display(), existing = keys.len(), "Opened JSONL sink");

        Ok(Self {
            path,
            state: tokio::sync::Mutex::new(JsonlState {
                keys,
                needs_newline: stored.needs_newline,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every stored record whose fields equal all pairs in `filter`.
    pub async fn records(&self, filter: &RecordFilter) -> Result<Vec<ResultRecord>> {
        // Hold the lock so a concurrent append is never read half-written.
        let _guard = self.state.lock().await;
        let mut matched = Vec::new();
        for record in read_records(&self.path).await?.records {
            if filter.matches(&record)? {
                matched.push(record);
            }
        }
        Ok(matched)
    }
}

#[async_trait]
impl ResultSink for JsonlSink {
    async fn append(&self, record: ResultRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (record.model.clone(), record.timestamp.clone());
        if state.keys.contains(&key) {
            return Err(duplicate_key(&record));
        }
        if state.dirty {
            state.needs_newline = repair_tail(&self.path).await?.needs_newline;
            state.dirty = false;
        }

        let mut line = String::new();
        if state.needs_newline {
            line.push('\n');
        }
        line.push_str(&serde_json::to_string(&record)?);
        line.push('\n');

        let sink_error = |e: std::io::Error| ChorusError::Sink(format!("{}: {e}", self.path.display()));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(sink_error)?;
        if let Err(e) = file.write_all(line.as_bytes()).await {
            state.dirty = true;
            return Err(sink_error(e));
        }
        file.flush().await.map_err(sink_error)?;

        state.needs_newline = false;
        state.keys.insert(key);
        Ok(())
    }
}

#[derive(Default)]
struct StoredRecords {
    records: Vec<ResultRecord>,
    /// Byte offset of an unparseable final line.
    torn_tail: Option<u64>,
    needs_newline: bool,
}

async fn read_records(path: &Path) -> Result<StoredRecords> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(StoredRecords::default());
    }
    // Lossy: a torn tail may end inside a multi-byte character.
    let bytes = tokio::fs::read(path).await?;
    let text = String::from_utf8_lossy(&bytes);

    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let last = lines.iter().rposition(|line| !line.trim().is_empty());

    let mut stored = StoredRecords {
        needs_newline: !text.is_empty() && !text.ends_with('\n'),
        ..Default::default()
    };
    let mut offset = 0u64;
    for (i, line) in lines.iter().enumerate() {
        let start = offset;
        offset += line.len() as u64;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ResultRecord>(line) {
            Ok(record) => stored.records.push(record),
            Err(e) if Some(i) == last => {
                tracing::warn!(
                    path = %path.display(),
                    line = i + 1,
                    error = %e,
                    "Skipping incomplete record at end of file"
                );
                stored.torn_tail = Some(start);
            }
            Err(e) => {
                return Err(ChorusError::Sink(format!(
                    "{}: line {}: {e}",
                    path.display(),
                    i + 1
                )))
            }
        }
    }
    Ok(stored)
}

/// Read the file and truncate an incomplete final line, if any.
async fn repair_tail(path: &Path) -> Result<StoredRecords> {
    let mut stored = read_records(path).await?;
    if let Some(offset) = stored.torn_tail.take() {
        let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(offset).await?;
        tracing::warn!(path = %path.display(), offset, "Truncated incomplete record");
        // The kept prefix ends at a line boundary.
        stored.needs_newline = false;
    }
    Ok(stored)
}

// ---------------------------------------------------------------------------
// RecordFilter
// ---------------------------------------------------------------------------

/// Attribute-equality filter over the serialized form of a record.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    conditions: Vec<(String, Value)>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field` to equal `value`. String fields compare against the
    /// text as given.
    pub fn field(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, record: &ResultRecord) -> Result<bool> {
        if self.conditions.is_empty() {
            return Ok(true);
        }
        let value = serde_json::to_value(record)?;
        Ok(self
            .conditions
            .iter()
            .all(|(field, expected)| value.get(field) == Some(expected)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_types::FixedSeconds;

    fn record(model: &str, timestamp: &str) -> ResultRecord {
        ResultRecord {
            model: model.into(),
            timestamp: timestamp.into(),
            batch_id: uuid::Uuid::new_v4(),
            sentiment: Some("positive".into()),
            categories: r#"{"Food":"Pizza"}"#.into(),
            prompt: "Human: ...".into(),
            run_time: FixedSeconds::from_millis(1250),
            response: "A sunny slice.".into(),
            request_body: "{}".into(),
            full_response: "{}".into(),
            error: None,
        }
    }

    #[tokio::test]
    async fn memory_sink_rejects_duplicate_key() {
        let sink = MemorySink::new();
        sink.append(record("gpt-4o", "2024-01-01T00:00:00.000001+00:00"))
            .await
            .unwrap();
        sink.append(record("gpt-4o", "2024-01-01T00:00:00.000002+00:00"))
            .await
            .unwrap();
        let err = sink
            .append(record("gpt-4o", "2024-01-01T00:00:00.000001+00:00"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChorusError::Sink(_)));
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn jsonl_sink_appends_and_reloads_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/records.jsonl");

        let sink = JsonlSink::open(&path).await.unwrap();
        sink.append(record("a", "t1")).await.unwrap();
        sink.append(record("b", "t1")).await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(text.lines().count(), 2);

        let reopened = JsonlSink::open(&path).await.unwrap();
        assert!(matches!(
            reopened.append(record("a", "t1")).await,
            Err(ChorusError::Sink(_))
        ));
        reopened.append(record("a", "t2")).await.unwrap();

        let all = reopened.records(&RecordFilter::new()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].run_time, FixedSeconds::from_millis(1250));
    }

    #[tokio::test]
    async fn jsonl_records_filter_by_equality() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::open(dir.path().join("r.jsonl")).await.unwrap();
        let mut negative = record("b", "t1");
        negative.sentiment = Some("negative".into());
        sink.append(record("a", "t1")).await.unwrap();
        sink.append(negative).await.unwrap();
        sink.append(record("a", "t2")).await.unwrap();

        let found = sink
            .records(&RecordFilter::new().field("model", "a"))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);

        let found = sink
            .records(
                &RecordFilter::new()
                    .field("sentiment", "negative")
                    .field("run_time", "1.250"),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].model, "b");

        let none = sink
            .records(&RecordFilter::new().field("model", "zzz"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    async fn write_raw(path: &Path, bytes: &str) {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .unwrap();
        file.write_all(bytes.as_bytes()).await.unwrap();
        file.flush().await.unwrap();
    }

    #[tokio::test]
    async fn torn_last_line_is_skipped_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.jsonl");

        let sink = JsonlSink::open(&path).await.unwrap();
        sink.append(record("a", "t1")).await.unwrap();
        let intact = tokio::fs::read_to_string(&path).await.unwrap();
        write_raw(&path, r#"{"model":"b","timesta"#).await;

        // A sink that was already open still reads past the fragment.
        let seen = sink.records(&RecordFilter::new()).await.unwrap();
        assert_eq!(seen.len(), 1);

        let reopened = JsonlSink::open(&path).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), intact);

        reopened.append(record("b", "t1")).await.unwrap();
        let all = reopened.records(&RecordFilter::new()).await.unwrap();
        let models: Vec<_> = all.iter().map(|r| r.model.as_str()).collect();
        assert_eq!(models, ["a", "b"]);
    }

    #[tokio::test]
    async fn corrupt_middle_line_names_the_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.jsonl");
        let good = serde_json::to_string(&record("a", "t1")).unwrap();
        write_raw(&path, &format!("{good}\nnot json\n{good}\n")).await;

        let err = JsonlSink::open(&path).await.err().unwrap();
        match err {
            ChorusError::Sink(message) => assert!(message.contains("line 2"), "{message}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn append_separates_from_unterminated_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unterminated.jsonl");
        let good = serde_json::to_string(&record("a", "t1")).unwrap();
        write_raw(&path, &good).await;

        let sink = JsonlSink::open(&path).await.unwrap();
        sink.append(record("b", "t1")).await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
        assert_eq!(sink.records(&RecordFilter::new()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_appends_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let sink = std::sync::Arc::new(JsonlSink::open(dir.path().join("c.jsonl")).await.unwrap());
        let mut set = tokio::task::JoinSet::new();
        for i in 0..16 {
            let sink = sink.clone();
            set.spawn(async move { sink.append(record(&format!("m{i}"), "t")).await });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap().unwrap();
        }
        assert_eq!(sink.records(&RecordFilter::new()).await.unwrap().len(), 16);
    }
}
