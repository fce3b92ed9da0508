//! Chunked file transfer
//!
//! Wire sequence per `fileId`: `file_start`, one `file_chunk` per binary slice
//! (base64, tagged with its index), `file_end`, answered by `file_ack`.
//! Different `fileId`s may interleave on the same socket.

use crate::error::TransferError;
use crate::platform;
use crate::protocol::{Message, Status};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Anything outbound frames can be handed to.
///
/// Waits while the outbound queue is full. Returns `false` when the frame
/// could not be queued (session not authenticated or already gone).
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_message(&self, msg: &Message) -> bool;
}

/// Split a payload into base64-encoded chunks of at most `chunk_size` binary bytes.
pub fn split_into_chunks(data: &[u8], chunk_size: usize) -> Vec<String> {
    data.chunks(chunk_size.max(1))
        .map(|chunk| BASE64.encode(chunk))
        .collect()
}

/// Number of binary bytes a padded base64 string decodes to.
pub fn decoded_len(encoded: &str) -> u64 {
    let padding = encoded.bytes().rev().take_while(|b| *b == b'=').count();
    ((encoded.len() / 4 * 3).saturating_sub(padding)) as u64
}

/// `floor(done / total * 100)`; an empty file is complete by definition.
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as u128 * 100 / total as u128).min(100)) as u8
}

/// Sender-side progress accounting based on decoded bytes, not chunk count
#[derive(Debug, Clone)]
pub struct SendProgress {
    total: u64,
    sent: u64,
    last_percent: Option<u8>,
}

impl SendProgress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            sent: 0,
            last_percent: None,
        }
    }

    /// Account for `bytes` of file data handed to the socket.
    /// Returns the percentage when it changed.
    pub fn record(&mut self, bytes: u64) -> Option<u8> {
        self.sent += bytes;
        // floor keeps this below 100 until every byte is accounted for
        let percent = progress_percent(self.sent.min(self.total), self.total);
        if self.last_percent == Some(percent) {
            return None;
        }
        self.last_percent = Some(percent);
        Some(percent)
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn percent(&self) -> u8 {
        self.last_percent.unwrap_or(0)
    }
}

/// Metadata announced in `file_start`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub mime: String,
}

impl FileMeta {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        let name = name.into();
        let mime = mime_guess::from_path(&name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Self {
            file_id: uuid::Uuid::new_v4().to_string(),
            name,
            size,
            mime,
        }
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Stream `reader` to the peer as one transfer.
///
/// Stops between chunks when `cancel` fires, without sending `file_end`.
/// `on_progress` sees a non-decreasing percentage that reaches 100 only
/// after the last byte was sent.
pub async fn send_reader<S, R>(
    sink: &S,
    mut reader: R,
    meta: &FileMeta,
    chunk_size: usize,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(u8),
) -> Result<(), TransferError>
where
    S: MessageSink + ?Sized,
    R: AsyncRead + Unpin,
{
    let start = Message::FileStart {
        file_id: meta.file_id.clone(),
        name: meta.name.clone(),
        size: meta.size,
        mime: meta.mime.clone(),
    };
    if !sink.send_message(&start).await {
        return Err(TransferError::ConnectionLost);
    }

    let mut progress = SendProgress::new(meta.size);
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut index = 0u64;

    loop {
        if cancel.is_cancelled() {
            tracing::info!("Transfer {} cancelled after {} chunks", meta.file_id, index);
            return Err(TransferError::Cancelled);
        }

        let n = match read_chunk(&mut reader, &mut buf).await {
            Ok(n) => n,
            Err(e) => {
                // let the receiver discard what it has
                let _ = sink
                    .send_message(&Message::FileEnd {
                        file_id: meta.file_id.clone(),
                    })
                    .await;
                return Err(TransferError::Read {
                    path: meta.name.clone(),
                    reason: e.to_string(),
                });
            }
        };
        if n == 0 {
            break;
        }

        let data = BASE64.encode(&buf[..n]);
        let chunk = Message::FileChunk {
            file_id: meta.file_id.clone(),
            index,
            data,
        };
        // a full queue holds us here, so progress follows the socket
        let queued = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Transfer {} cancelled after {} chunks", meta.file_id, index);
                return Err(TransferError::Cancelled);
            }
            queued = sink.send_message(&chunk) => queued,
        };
        if !queued {
            return Err(TransferError::ConnectionLost);
        }
        if let Some(percent) = progress.record(n as u64) {
            on_progress(percent);
        }
        index += 1;
    }

    let end = Message::FileEnd {
        file_id: meta.file_id.clone(),
    };
    if !sink.send_message(&end).await {
        return Err(TransferError::ConnectionLost);
    }

    if meta.size == 0 {
        on_progress(100);
    }
    tracing::debug!("Sent {} in {} chunks", meta.name, index);
    Ok(())
}

/// Read `path` and send it. A file that can't be opened fails before any frame goes out.
pub async fn send_path<S: MessageSink + ?Sized>(
    sink: &S,
    path: &Path,
    chunk_size: usize,
    cancel: &CancellationToken,
    on_progress: impl FnMut(u8),
) -> Result<FileMeta, TransferError> {
    let read_err = |e: std::io::Error| TransferError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    let file = tokio::fs::File::open(path).await.map_err(read_err)?;
    let size = file.metadata().await.map_err(read_err)?.len();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());

    let meta = FileMeta::new(name, size);
    send_reader(sink, file, &meta, chunk_size, cancel, on_progress).await?;
    Ok(meta)
}

/// Receiver-side state of one upload
#[derive(Debug)]
struct IncomingTransfer {
    name: String,
    size: u64,
    mime: String,
    chunks: BTreeMap<u64, Vec<u8>>,
    received_bytes: u64,
    error: Option<TransferError>,
}

/// Per-session table of in-flight uploads, keyed by `fileId`.
///
/// Dropping the table discards every partial transfer.
#[derive(Debug)]
pub struct TransferTable {
    download_dir: PathBuf,
    max_file_size: u64,
    transfers: HashMap<String, IncomingTransfer>,
}

impl TransferTable {
    pub fn new(download_dir: PathBuf, max_file_size: u64) -> Self {
        Self {
            download_dir,
            max_file_size,
            transfers: HashMap::new(),
        }
    }

    /// Handle `file_start`
    pub fn start(&mut self, file_id: &str, name: &str, size: u64, mime: &str) -> Result<(), TransferError> {
        if size > self.max_file_size {
            return Err(TransferError::TooLarge {
                file: name.to_string(),
                size,
                limit: self.max_file_size,
            });
        }

        let previous = self.transfers.insert(
            file_id.to_string(),
            IncomingTransfer {
                name: name.to_string(),
                size,
                mime: mime.to_string(),
                chunks: BTreeMap::new(),
                received_bytes: 0,
                error: None,
            },
        );
        if previous.is_some() {
            tracing::warn!("file_start for {} restarted an existing transfer", file_id);
        }
        tracing::info!("Receiving {} ({} bytes, {})", name, size, mime);
        Ok(())
    }

    /// Handle `file_chunk`. Chunks are placed by `index`, whatever the arrival order.
    ///
    /// Returns bytes received so far for this file.
    pub fn chunk(&mut self, file_id: &str, index: u64, data: &str) -> Result<u64, TransferError> {
        let transfer = self
            .transfers
            .get_mut(file_id)
            .ok_or_else(|| TransferError::UnknownTransfer(file_id.to_string()))?;

        if let Some(err) = &transfer.error {
            return Err(err.clone());
        }

        let bytes = match BASE64.decode(data) {
            Ok(b) => b,
            Err(_) => {
                let err = TransferError::InvalidChunk {
                    file: transfer.name.clone(),
                    index,
                };
                transfer.fail(err.clone());
                return Err(err);
            }
        };

        let added = bytes.len() as u64;
        if let Some(replaced) = transfer.chunks.insert(index, bytes) {
            transfer.received_bytes -= replaced.len() as u64;
        }
        transfer.received_bytes += added;

        if transfer.received_bytes > transfer.size {
            let err = TransferError::SizeMismatch {
                file: transfer.name.clone(),
                declared: transfer.size,
                received: transfer.received_bytes,
            };
            transfer.fail(err.clone());
            return Err(err);
        }

        Ok(transfer.received_bytes)
    }

    /// Handle `file_end`: verify, assemble in index order, write to disk.
    ///
    /// The transfer is removed either way; nothing is written on failure.
    pub async fn finish(&mut self, file_id: &str) -> Result<PathBuf, TransferError> {
        let transfer = self
            .transfers
            .remove(file_id)
            .ok_or_else(|| TransferError::UnknownTransfer(file_id.to_string()))?;

        if let Some(err) = transfer.error {
            return Err(err);
        }

        for (expected, index) in transfer.chunks.keys().enumerate() {
            if *index != expected as u64 {
                return Err(TransferError::ChunkGap {
                    file: transfer.name,
                    missing: expected as u64,
                });
            }
        }

        if transfer.received_bytes != transfer.size {
            return Err(TransferError::SizeMismatch {
                file: transfer.name,
                declared: transfer.size,
                received: transfer.received_bytes,
            });
        }

        let mut contents = Vec::with_capacity(transfer.size as usize);
        for chunk in transfer.chunks.into_values() {
            contents.extend_from_slice(&chunk);
        }

        let path = write_unique(&self.download_dir, &transfer.name, &contents).await?;
        tracing::info!(
            "Saved {} ({} bytes, {})",
            path.display(),
            contents.len(),
            transfer.mime
        );
        Ok(path)
    }

    /// Receive progress for one file, by decoded bytes
    pub fn progress(&self, file_id: &str) -> Option<u8> {
        self.transfers
            .get(file_id)
            .map(|t| progress_percent(t.received_bytes.min(t.size), t.size))
    }

    pub fn active(&self) -> usize {
        self.transfers.len()
    }

    /// Drop all partial state (peer went away)
    pub fn clear(&mut self) {
        if !self.transfers.is_empty() {
            tracing::info!("Discarding {} unfinished transfer(s)", self.transfers.len());
        }
        self.transfers.clear();
    }
}

impl IncomingTransfer {
    fn fail(&mut self, err: TransferError) {
        tracing::warn!("Transfer of {} failed: {}", self.name, err);
        self.chunks.clear();
        self.error = Some(err);
    }
}

/// Build the `file_ack` for a finished (or failed) upload.
pub fn ack_for(file_id: &str, result: &Result<PathBuf, TransferError>) -> Message {
    match result {
        Ok(_) => Message::FileAck {
            file_id: file_id.to_string(),
            status: Status::Success,
            error: None,
        },
        Err(e) => Message::FileAck {
            file_id: file_id.to_string(),
            status: Status::Error,
            error: Some(e.to_string()),
        },
    }
}

/// Reduce an announced filename to something safe to create in the downloads dir.
pub fn sanitize_file_name(name: &str) -> String {
    let base = platform::extract_path_basename(name).trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*') {
                '_'
            } else {
                c
            }
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "file".to_string(),
        _ => cleaned,
    }
}

fn numbered_name(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    let path = Path::new(name);
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => format!(
            "{} ({}).{}",
            stem.to_string_lossy(),
            n,
            ext.to_string_lossy()
        ),
        _ => format!("{} ({})", name, n),
    }
}

/// Write `contents` under `dir` without overwriting: `name`, `name (1)`, `name (2)`...
pub async fn write_unique(dir: &Path, name: &str, contents: &[u8]) -> Result<PathBuf, TransferError> {
    let write_err = |path: &Path, e: std::io::Error| TransferError::Write {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| write_err(dir, e))?;

    let name = sanitize_file_name(name);
    for n in 0..10_000 {
        let candidate = dir.join(numbered_name(&name, n));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await;

        match file {
            Ok(mut file) => {
                file.write_all(contents)
                    .await
                    .map_err(|e| write_err(&candidate, e))?;
                file.flush().await.map_err(|e| write_err(&candidate, e))?;
                return Ok(candidate);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(write_err(&candidate, e)),
        }
    }

    Err(TransferError::Write {
        path: dir.join(name).display().to_string(),
        reason: "too many files with the same name".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect {
        frames: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl MessageSink for Collect {
        async fn send_message(&self, msg: &Message) -> bool {
            self.frames.lock().unwrap().push(msg.clone());
            true
        }
    }

    /// Accepts `capacity` frames, then blocks until `drain` frees room
    struct Bounded {
        tx: tokio::sync::mpsc::Sender<Message>,
    }

    #[async_trait]
    impl MessageSink for Bounded {
        async fn send_message(&self, msg: &Message) -> bool {
            self.tx.send(msg.clone()).await.is_ok()
        }
    }

    fn sample_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_chunk_count_and_encoded_length() {
        let data = sample_bytes(64 * 1024 * 2 + 10);
        let chunks = split_into_chunks(&data, 64 * 1024);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), (64 * 1024 + 2) / 3 * 4);
        assert_eq!(decoded_len(&chunks[0]), 64 * 1024);
        assert_eq!(decoded_len(&chunks[2]), 10);
    }

    #[tokio::test]
    async fn test_round_trip_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        for (size, chunk_size) in [(0usize, 7usize), (1, 7), (100, 7), (1000, 64), (4096, 1024)] {
            let data = sample_bytes(size);
            let mut chunks: Vec<(u64, String)> = split_into_chunks(&data, chunk_size)
                .into_iter()
                .enumerate()
                .map(|(i, c)| (i as u64, c))
                .collect();
            assert_eq!(chunks.len(), size.div_ceil(chunk_size));
            chunks.shuffle(&mut rand::thread_rng());

            let mut table = TransferTable::new(dir.path().to_path_buf(), u64::MAX);
            let id = format!("f-{}-{}", size, chunk_size);
            table.start(&id, "blob.bin", size as u64, "application/octet-stream").unwrap();
            for (index, chunk) in &chunks {
                table.chunk(&id, *index, chunk).unwrap();
            }

            let path = table.finish(&id).await.unwrap();
            assert_eq!(tokio::fs::read(&path).await.unwrap(), data);
        }
    }

    #[test]
    fn test_progress_is_monotonic_and_ends_at_100() {
        let data = sample_bytes(10_000);
        let chunks = split_into_chunks(&data, 3_000);
        let mut progress = SendProgress::new(data.len() as u64);

        let mut seen = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if let Some(p) = progress.record(decoded_len(chunk)) {
                seen.push(p);
            }
            if i + 1 < chunks.len() {
                assert!(progress.percent() < 100);
            }
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen, vec![30, 60, 90, 100]);
    }

    #[test]
    fn test_progress_floor_never_rounds_up_to_100() {
        let mut progress = SendProgress::new(1000);
        assert_eq!(progress.record(999), Some(99));
        assert_eq!(progress.record(1), Some(100));
    }

    #[tokio::test]
    async fn test_undersized_transfer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = TransferTable::new(dir.path().to_path_buf(), u64::MAX);
        table.start("f1", "half.bin", 100, "application/octet-stream").unwrap();
        table.chunk("f1", 0, &BASE64.encode(vec![7u8; 50])).unwrap();

        let result = table.finish("f1").await;
        assert!(matches!(
            result,
            Err(TransferError::SizeMismatch { declared: 100, received: 50, .. })
        ));
        assert_eq!(table.active(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        match ack_for("f1", &result) {
            Message::FileAck { status, .. } => assert_eq!(status, Status::Error),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_gap_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = TransferTable::new(dir.path().to_path_buf(), u64::MAX);
        table.start("f1", "gap.bin", 4, "application/octet-stream").unwrap();
        table.chunk("f1", 0, &BASE64.encode([1u8, 2])).unwrap();
        table.chunk("f1", 2, &BASE64.encode([3u8, 4])).unwrap();

        assert_eq!(
            table.finish("f1").await,
            Err(TransferError::ChunkGap {
                file: "gap.bin".into(),
                missing: 1
            })
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_base64_poisons_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = TransferTable::new(dir.path().to_path_buf(), u64::MAX);
        table.start("f1", "bad.bin", 3, "text/plain").unwrap();
        assert!(table.chunk("f1", 0, "%%%").is_err());
        assert!(table.chunk("f1", 1, &BASE64.encode([1u8])).is_err());
        assert!(matches!(
            table.finish("f1").await,
            Err(TransferError::InvalidChunk { index: 0, .. })
        ));
    }

    #[test]
    fn test_duplicate_chunk_is_not_double_counted() {
        let mut table = TransferTable::new(PathBuf::from("."), u64::MAX);
        table.start("f1", "a", 4, "text/plain").unwrap();
        assert_eq!(table.chunk("f1", 0, &BASE64.encode([1u8, 2])).unwrap(), 2);
        assert_eq!(table.chunk("f1", 0, &BASE64.encode([1u8, 2])).unwrap(), 2);
        assert_eq!(table.progress("f1"), Some(50));
    }

    #[test]
    fn test_limits_and_unknown_ids() {
        let mut table = TransferTable::new(PathBuf::from("."), 10);
        assert!(matches!(
            table.start("f1", "big", 11, "x"),
            Err(TransferError::TooLarge { .. })
        ));
        assert_eq!(
            table.chunk("nope", 0, "AA=="),
            Err(TransferError::UnknownTransfer("nope".into()))
        );
    }

    #[tokio::test]
    async fn test_collisions_get_numbered() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_unique(dir.path(), "report.pdf", b"1").await.unwrap();
        let second = write_unique(dir.path(), "report.pdf", b"2").await.unwrap();
        let third = write_unique(dir.path(), "README", b"3").await.unwrap();
        let fourth = write_unique(dir.path(), "README", b"4").await.unwrap();

        assert!(first.ends_with("report.pdf"));
        assert!(second.ends_with("report (1).pdf"));
        assert!(third.ends_with("README"));
        assert!(fourth.ends_with("README (1)"));
        assert_eq!(std::fs::read(&first).unwrap(), b"1");
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name(r"C:\tmp\a:b.txt"), "a_b.txt");
        assert_eq!(sanitize_file_name("what?.txt"), "what_.txt");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name(""), "file");
    }

    #[tokio::test]
    async fn test_send_reader_frames() {
        let sink = Collect::default();
        let data = sample_bytes(10);
        let meta = FileMeta::new("notes.txt", data.len() as u64);
        let mut percents = Vec::new();

        send_reader(&sink, &data[..], &meta, 4, &CancellationToken::new(), |p| percents.push(p))
            .await
            .unwrap();

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 5);
        assert!(matches!(&frames[0], Message::FileStart { size: 10, mime, .. } if mime == "text/plain"));
        assert!(matches!(&frames[3], Message::FileChunk { index: 2, .. }));
        assert!(matches!(&frames[4], Message::FileEnd { .. }));
        assert_eq!(percents, vec![40, 80, 100]);
    }

    #[tokio::test]
    async fn test_cancel_stops_before_file_end() {
        let sink = Collect::default();
        let data = sample_bytes(100);
        let meta = FileMeta::new("a.bin", 100);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = send_reader(&sink, &data[..], &meta, 10, &cancel, |_| {}).await;
        assert_eq!(result, Err(TransferError::Cancelled));
        let frames = sink.frames.lock().unwrap();
        assert!(!frames.iter().any(|f| matches!(f, Message::FileEnd { .. })));
    }

    #[tokio::test]
    async fn test_unreadable_file_sends_nothing() {
        let sink = Collect::default();
        let result = send_path(
            &sink,
            Path::new("/definitely/not/here.bin"),
            1024,
            &CancellationToken::new(),
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(TransferError::Read { .. })));
        assert!(sink.frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_progress_waits_for_a_full_queue() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(2);
        let sink = Bounded { tx };
        let data = sample_bytes(1000);
        let meta = FileMeta::new("slow.bin", 1000);
        let percents = Mutex::new(Vec::new());

        let cancel = CancellationToken::new();
        let send = send_reader(&sink, &data[..], &meta, 100, &cancel, |p| {
            percents.lock().unwrap().push(p)
        });
        tokio::pin!(send);

        // nobody drains: file_start plus one chunk fill the queue
        let stalled = tokio::time::timeout(Duration::from_millis(200), &mut send).await;
        assert!(stalled.is_err());
        assert_eq!(*percents.lock().unwrap(), vec![10]);

        let drain = async {
            let mut frames = 0;
            while rx.recv().await.is_some() {
                frames += 1;
                if frames == 12 {
                    break;
                }
            }
            frames
        };
        let (result, frames) = tokio::join!(send, drain);
        result.unwrap();
        assert_eq!(frames, 12);
        assert_eq!(percents.lock().unwrap().last(), Some(&100));
    }

    #[tokio::test]
    async fn test_cancel_while_queue_is_full() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let sink = Bounded { tx };
        let data = sample_bytes(1000);
        let meta = FileMeta::new("stuck.bin", 1000);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result = send_reader(&sink, &data[..], &meta, 100, &cancel, |_| {}).await;
        assert_eq!(result, Err(TransferError::Cancelled));
    }

    #[tokio::test]
    async fn test_empty_file_sends_no_chunks() {
        let sink = Collect::default();
        let meta = FileMeta::new("empty.txt", 0);
        let mut percents = Vec::new();
        send_reader(&sink, &b""[..], &meta, 16, &CancellationToken::new(), |p| percents.push(p))
            .await
            .unwrap();

        assert_eq!(sink.frames.lock().unwrap().len(), 2);
        assert_eq!(percents, vec![100]);
    }
}
