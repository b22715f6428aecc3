//! 세그먼트 파일 저장소.
//!
//! 수집 실행 한 번의 배치가 하나의 세그먼트 파일이 됩니다.
//!
//! ```text
//! <data_dir>/<category>/<YYYY-MM-DD>/<seq>-<collector>.jsonl
//! ```
//!
//! - 세그먼트는 임시 파일에 쓰고 fsync한 뒤 rename으로 한 번에 공개합니다.
//!   rename 이전에 실패하면 배치의 어떤 레코드도 보이지 않습니다.
//! - natural key 인덱스로 같은 페이로드는 건너뛰고, 바뀐 레코드는 새 세그먼트에
//!   쓴 뒤 이전 세그먼트에서 해당 줄을 제거합니다 (역시 rename으로 교체).
//! - 열 때 모든 세그먼트를 인덱싱하고, 남아 있는 임시 파일은 지우며,
//!   rewrite 도중 중단되어 남은 중복은 최신 세그먼트 기준으로 정리합니다.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use harvest_core::Record;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, StorageError};
use crate::sink::{dedup_last_wins, payload_digest, RecordSink, WriteSummary};

const SEGMENT_EXT: &str = "jsonl";
const TMP_EXT: &str = "tmp";

/// 인덱스 항목: 키의 현재 버전이 있는 세그먼트.
#[derive(Debug, Clone)]
struct IndexEntry {
    segment: PathBuf,
    digest: String,
}

#[derive(Debug, Default)]
struct FileState {
    index: HashMap<String, IndexEntry>,
    next_seq: u64,
}

/// 디스크 위의 세그먼트.
#[derive(Debug, Clone)]
struct Segment {
    seq: u64,
    path: PathBuf,
}

/// 카테고리/날짜로 파티션된 append-only 파일 저장소.
pub struct FileSink {
    root: PathBuf,
    state: Mutex<FileState>,
    #[cfg(test)]
    fail_after_lines: std::sync::Mutex<Option<usize>>,
}

impl FileSink {
    /// 저장소 디렉터리를 열고 인덱스를 재구성합니다.
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let (segments, stray) = scan(&root).await?;
        for tmp in stray {
            warn!(path = %tmp.display(), "Removing incomplete segment");
            fs::remove_file(&tmp).await?;
        }

        let mut state = FileState::default();
        // 오래된 세그먼트에 남은 중복 키 (세그먼트 → 키 목록)
        let mut stale: HashMap<PathBuf, HashSet<String>> = HashMap::new();

        for segment in &segments {
            for record in read_segment(&segment.path).await? {
                let entry = IndexEntry {
                    segment: segment.path.clone(),
                    digest: payload_digest(&record)?,
                };
                if let Some(previous) = state.index.insert(record.natural_key.clone(), entry) {
                    if previous.segment != segment.path {
                        stale
                            .entry(previous.segment)
                            .or_default()
                            .insert(record.natural_key);
                    }
                }
            }
            state.next_seq = state.next_seq.max(segment.seq + 1);
        }

        for (path, keys) in stale {
            warn!(
                segment = %path.display(),
                keys = keys.len(),
                "Repairing superseded records"
            );
            remove_keys(&path, &keys).await?;
        }

        info!(
            segments = segments.len(),
            keys = state.index.len(),
            "File sink opened"
        );

        Ok(Self {
            root,
            state: Mutex::new(state),
            #[cfg(test)]
            fail_after_lines: std::sync::Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 인덱스된 키 수.
    pub async fn key_count(&self) -> usize {
        self.state.lock().await.index.len()
    }

    /// 모든 세그먼트의 레코드를 읽습니다 (키별 최신 버전만).
    pub async fn read_all(&self) -> Result<Vec<Record>> {
        let _guard = self.state.lock().await;
        let (segments, _) = scan(&self.root).await?;

        let mut latest: HashMap<String, Record> = HashMap::new();
        for segment in segments {
            for record in read_segment(&segment.path).await? {
                latest.insert(record.natural_key.clone(), record);
            }
        }

        let mut records: Vec<Record> = latest.into_values().collect();
        records.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        Ok(records)
    }

    /// 세그먼트 파일 수.
    pub async fn segment_count(&self) -> Result<usize> {
        let _guard = self.state.lock().await;
        Ok(scan(&self.root).await?.0.len())
    }

    #[cfg(test)]
    fn fail_next_write_after(&self, lines: usize) {
        if let Ok(mut fail) = self.fail_after_lines.lock() {
            *fail = Some(lines);
        }
    }

    #[cfg(test)]
    fn take_fault(&self) -> Option<usize> {
        self.fail_after_lines.lock().ok().and_then(|mut f| f.take())
    }

    #[cfg(not(test))]
    fn take_fault(&self) -> Option<usize> {
        None
    }

    /// 세그먼트를 임시 파일에 쓰고 fsync 후 rename으로 공개합니다.
    async fn commit_segment(&self, path: &Path, records: &[&Record]) -> Result<()> {
        let tmp = tmp_path(path);
        let result = self.write_tmp(&tmp, records).await;
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        sync_parent(path).await;
        Ok(())
    }

    async fn write_tmp(&self, tmp: &Path, records: &[&Record]) -> Result<()> {
        let fault = self.take_fault();
        let mut file = fs::File::create(tmp).await?;

        for (i, record) in records.iter().enumerate() {
            if fault == Some(i) {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("injected failure after {} lines", i),
                )));
            }
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            file.write_all(&line).await?;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl RecordSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn write(&self, records: &[Record]) -> Result<WriteSummary> {
        let mut summary = WriteSummary {
            received: records.len(),
            ..Default::default()
        };
        let Some(first) = records.first() else {
            return Ok(summary);
        };

        let mut state = self.state.lock().await;

        let mut changed = Vec::new();
        for record in dedup_last_wins(records) {
            let digest = payload_digest(record)?;
            match state.index.get(&record.natural_key) {
                Some(entry) if entry.digest == digest => summary.unchanged += 1,
                _ => changed.push((record, digest)),
            }
        }

        if changed.is_empty() {
            debug!(unchanged = summary.unchanged, "Nothing to write");
            return Ok(summary);
        }

        // 한 배치는 한 번의 수집 실행에서 나오므로 카테고리가 하나
        let partition = self
            .root
            .join(first.category.as_str())
            .join(Utc::now().date_naive().format("%Y-%m-%d").to_string());
        fs::create_dir_all(&partition).await?;

        let seq = state.next_seq;
        let path = partition.join(format!(
            "{:010}-{}.{}",
            seq,
            sanitize(&first.source_collector_id),
            SEGMENT_EXT
        ));

        let lines: Vec<&Record> = changed.iter().map(|(r, _)| *r).collect();
        self.commit_segment(&path, &lines).await?;
        state.next_seq = seq + 1;

        // 커밋 이후: 인덱스 갱신, 이전 버전 제거
        let mut superseded: HashMap<PathBuf, HashSet<String>> = HashMap::new();
        for (record, digest) in changed {
            let entry = IndexEntry {
                segment: path.clone(),
                digest,
            };
            if let Some(previous) = state.index.insert(record.natural_key.clone(), entry) {
                superseded
                    .entry(previous.segment)
                    .or_default()
                    .insert(record.natural_key.clone());
            }
        }
        summary.written = lines.len();

        for (old, keys) in superseded {
            // 실패해도 배치는 이미 커밋됨; 다음 open에서 정리
            if let Err(e) = remove_keys(&old, &keys).await {
                warn!(segment = %old.display(), error = %e, "Failed to prune superseded records");
            }
        }

        debug!(
            segment = %path.display(),
            written = summary.written,
            unchanged = summary.unchanged,
            "Segment committed"
        );

        Ok(summary)
    }

    async fn health_check(&self) -> Result<()> {
        fs::metadata(&self.root).await?;
        Ok(())
    }
}

/// `<root>/<category>/<date>/` 아래의 세그먼트와 임시 파일을 찾습니다.
///
/// 세그먼트는 시퀀스 순으로 정렬됩니다.
async fn scan(root: &Path) -> Result<(Vec<Segment>, Vec<PathBuf>)> {
    let mut segments = Vec::new();
    let mut stray = Vec::new();

    for category_dir in subdirs(root).await? {
        for partition in subdirs(&category_dir).await? {
            let mut entries = fs::read_dir(&partition).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                match path.extension().and_then(|e| e.to_str()) {
                    Some(TMP_EXT) => stray.push(path),
                    Some(SEGMENT_EXT) => match parse_seq(&path) {
                        Some(seq) => segments.push(Segment { seq, path }),
                        None => warn!(path = %path.display(), "Ignoring unrecognised segment name"),
                    },
                    _ => {}
                }
            }
        }
    }

    segments.sort_by_key(|s| s.seq);
    Ok((segments, stray))
}

async fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

async fn read_segment(path: &Path) -> Result<Vec<Record>> {
    let content = fs::read_to_string(path).await?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<Record>(line).map_err(|e| StorageError::CorruptSegment {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// 세그먼트에서 주어진 키의 줄을 제거합니다. 비게 되면 파일을 지웁니다.
async fn remove_keys(path: &Path, keys: &HashSet<String>) -> Result<()> {
    let remaining: Vec<Record> = read_segment(path)
        .await?
        .into_iter()
        .filter(|r| !keys.contains(&r.natural_key))
        .collect();

    if remaining.is_empty() {
        fs::remove_file(path).await?;
        return Ok(());
    }

    let tmp = tmp_path(path);
    let mut content = Vec::new();
    for record in &remaining {
        serde_json::to_writer(&mut content, record)?;
        content.push(b'\n');
    }

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&content).await?;
    file.sync_all().await?;
    fs::rename(&tmp, path).await?;
    sync_parent(path).await;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension(TMP_EXT)
}

fn parse_seq(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let (seq, _) = stem.split_once('-')?;
    seq.parse().ok()
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// rename 결과를 디렉터리 수준에서 영속화합니다.
async fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::{Category, NewsArticle, Payload};

    fn article(i: usize, headline: &str) -> Record {
        Record::new(
            "unstructured_data.news",
            Category::News,
            Utc::now(),
            Payload::NewsArticle(NewsArticle {
                source: "Example".to_string(),
                headline: headline.to_string(),
                url: Some(format!("https://example.com/{}", i)),
                summary: None,
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_write_creates_partitioned_segment() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::open(dir.path()).await.unwrap();

        let summary = sink.write(&[article(1, "a"), article(2, "b")]).await.unwrap();
        assert_eq!(summary.written, 2);

        let partition = dir
            .path()
            .join("news")
            .join(Utc::now().date_naive().format("%Y-%m-%d").to_string());
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&partition).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["0000000000-unstructured_data.news.jsonl"]);
    }

    #[tokio::test]
    async fn test_failure_midway_leaves_nothing_visible() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::open(dir.path()).await.unwrap();
        let batch: Vec<Record> = (0..10).map(|i| article(i, "h")).collect();

        sink.fail_next_write_after(4);
        assert!(sink.write(&batch).await.is_err());

        assert!(sink.read_all().await.unwrap().is_empty());
        assert_eq!(sink.segment_count().await.unwrap(), 0);
        assert_eq!(sink.key_count().await, 0);

        // 재시도는 전체 배치를 반영
        sink.write(&batch).await.unwrap();
        assert_eq!(sink.read_all().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_superseded_line_is_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::open(dir.path()).await.unwrap();

        sink.write(&[article(1, "old"), article(2, "keep")]).await.unwrap();
        sink.write(&[article(1, "new")]).await.unwrap();

        let records = sink.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        let (segments, _) = scan(dir.path()).await.unwrap();
        let mut lines = 0;
        for segment in &segments {
            lines += read_segment(&segment.path).await.unwrap().len();
        }
        // 디스크 전체에 키당 한 줄만 존재
        assert_eq!(lines, 2);
    }

    #[tokio::test]
    async fn test_key_from_earlier_partition_is_recognised() {
        let dir = tempfile::tempdir().unwrap();
        let earlier = dir.path().join("news").join("2024-01-01");
        fs::create_dir_all(&earlier).await.unwrap();
        let mut line = serde_json::to_vec(&article(1, "old")).unwrap();
        line.push(b'\n');
        fs::write(earlier.join("0000000000-unstructured_data.news.jsonl"), &line)
            .await
            .unwrap();

        let sink = FileSink::open(dir.path()).await.unwrap();
        let summary = sink.write(&[article(1, "old")]).await.unwrap();
        assert_eq!(summary.written, 0);
        assert_eq!(summary.unchanged, 1);

        // 새 버전은 오늘 파티션에 쓰이고 이전 파티션의 줄은 제거됨
        sink.write(&[article(1, "new")]).await.unwrap();
        let (segments, _) = scan(dir.path()).await.unwrap();
        let mut lines = 0;
        for segment in &segments {
            lines += read_segment(&segment.path).await.unwrap().len();
        }
        assert_eq!(lines, 1);
        assert_eq!(sink.key_count().await, 1);
    }

    #[tokio::test]
    async fn test_open_removes_stray_tmp_files() {
        let dir = tempfile::tempdir().unwrap();
        let partition = dir.path().join("news").join("2024-01-01");
        fs::create_dir_all(&partition).await.unwrap();
        fs::write(partition.join("0000000003-x.tmp"), b"{partial")
            .await
            .unwrap();

        let sink = FileSink::open(dir.path()).await.unwrap();
        assert!(sink.read_all().await.unwrap().is_empty());
        assert!(!partition.join("0000000003-x.tmp").exists());
    }

    #[test]
    fn test_parse_seq_and_sanitize() {
        assert_eq!(
            parse_seq(Path::new("/d/0000000042-market_data.equities.jsonl")),
            Some(42)
        );
        assert_eq!(parse_seq(Path::new("/d/garbage.jsonl")), None);
        assert_eq!(sanitize("a/b c"), "a_b_c");
    }
}
