//! The retry/resume state machine driving one upload.
//!
//! `Allocating -> Connecting -> Streaming -> (Complete | Interrupted |
//! Fatal)`, with `Interrupted -> Connecting` forming the retry loop and a
//! distinct `Cancelled` terminal state for caller-initiated aborts.
//!
//! On every (re)connect the storage node's first status record supersedes
//! the locally tracked offset; the chunk source is re-created and seeked
//! there, so already-acknowledged bytes are never read again, let alone
//! re-sent.

use std::path::Path;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use packmule_protocol::messages::{FileHandle, FileMetadata, StreamOpenRequest};
use packmule_transfer::{ChunkSource, ProgressGauge, TransferProgress};

use crate::channel::{ChannelEvent, TransferChannel};
use crate::master::MasterClient;
use crate::{ClientConfig, ClientError};

/// States of the resume controller.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadState {
    /// Asking the master for a file handle.
    Allocating,
    /// Opening a transfer channel (attempt is 1-based).
    Connecting { attempt: u32 },
    /// Chunks are flowing.
    Streaming,
    /// Transport failure; will reconnect and resume from `offset`.
    Interrupted { offset: i64 },
    /// Terminal: every byte acknowledged.
    Complete,
    /// Terminal: unrecoverable failure, no further retries.
    Fatal,
    /// Terminal: caller-initiated abort, no further retries.
    Cancelled,
}

/// Observable events emitted while an upload runs.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    StateChanged(UploadState),
    /// The master granted a handle (emitted once, before streaming).
    Granted(FileHandle),
    /// Progress: bytes acknowledged so far, across retries.
    Progress(TransferProgress),
    Completed {
        file_id: String,
        bytes: i64,
    },
    Failed {
        error: String,
        last_offset: i64,
    },
}

/// The final result of a successful upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReport {
    pub file_id: String,
    pub bytes: i64,
}

/// How one streaming attempt ended.
enum StreamOutcome {
    Done(i64),
    Failed(ClientError),
}

/// Drives a single upload to completion, through however many transfer
/// channel connections it takes.
pub struct UploadController {
    config: ClientConfig,
    events_tx: mpsc::Sender<UploadEvent>,
    cancel: CancellationToken,
}

impl UploadController {
    /// Creates a controller and the event stream callers observe.
    pub fn new(config: ClientConfig) -> (Self, mpsc::Receiver<UploadEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        (
            Self {
                config,
                events_tx,
                cancel: CancellationToken::new(),
            },
            events_rx,
        )
    }

    /// Token that aborts the upload when cancelled. Cancellation closes the
    /// active channel and halts the state machine without further retries.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the full upload: allocation, then streaming with resume.
    pub async fn run(&self, master_url: &str, path: &Path) -> Result<UploadReport, ClientError> {
        let filename = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => {
                let e = std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("path has no filename: {}", path.display()),
                );
                return self.fail(e.into(), 0).await;
            }
        };
        let size_bytes = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len() as i64,
            Err(e) => return self.fail(e.into(), 0).await,
        };

        self.emit_state(UploadState::Allocating).await;

        let meta = FileMetadata {
            filename,
            size_bytes,
        };
        let mut failures: u32 = 0;
        let handle = loop {
            if self.cancel.is_cancelled() {
                return self.cancelled().await;
            }
            match MasterClient::request_upload(master_url, &meta, &self.config).await {
                Ok(handle) => break handle,
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    tracing::warn!(error = %e, failures, "allocation failed, will retry");
                    if failures > self.config.max_retries {
                        return self
                            .fail(ClientError::RetriesExhausted { last_offset: 0 }, 0)
                            .await;
                    }
                    let delay = self.config.backoff.delay_for_attempt(failures);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return self.cancelled().await,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return self.fail(e, 0).await,
            }
        };

        let _ = self.events_tx.send(UploadEvent::Granted(handle.clone())).await;
        self.run_with_handle(&handle, path).await
    }

    /// Streams `path` under an already-allocated handle.
    ///
    /// The handle is pinned: every resume attempt reuses the same file id,
    /// storage node and token.
    pub async fn run_with_handle(
        &self,
        handle: &FileHandle,
        path: &Path,
    ) -> Result<UploadReport, ClientError> {
        let size_bytes = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len() as i64,
            Err(e) => return self.fail(e.into(), 0).await,
        };
        let mut gauge = ProgressGauge::new(&handle.file_id, size_bytes);

        // A zero-byte file has nothing to transfer: no channel is opened.
        if size_bytes == 0 {
            return self.finish(&mut gauge, &handle.file_id, 0).await;
        }

        let mut failures: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return self.cancelled().await;
            }

            self.emit_state(UploadState::Connecting {
                attempt: failures + 1,
            })
            .await;
            if failures > 0 {
                let delay = self.config.backoff.delay_for_attempt(failures);
                tracing::debug!(delay_ms = delay.as_millis() as u64, "backing off before reconnect");
                tokio::select! {
                    _ = self.cancel.cancelled() => return self.cancelled().await,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let open = StreamOpenRequest {
                file_id: handle.file_id.clone(),
                size_bytes,
                token: handle.token.clone(),
            };
            let (channel, mut events, server_offset) =
                match TransferChannel::open(&handle.storage_address, &open, &self.config).await {
                    Ok(opened) => opened,
                    Err(e) if e.is_retryable() => {
                        failures += 1;
                        tracing::warn!(error = %e, failures, "connect failed");
                        if failures > self.config.max_retries {
                            return self
                                .fail(
                                    ClientError::RetriesExhausted {
                                        last_offset: gauge.acked(),
                                    },
                                    gauge.acked(),
                                )
                                .await;
                        }
                        continue;
                    }
                    Err(e) => return self.fail(e, gauge.acked()).await,
                };

            // The first status record is the authoritative resume point.
            if server_offset < 0 || server_offset > size_bytes {
                channel.close();
                return self
                    .fail(
                        ClientError::ProtocolViolation(format!(
                            "server resume offset {server_offset} outside [0, {size_bytes}]"
                        )),
                        gauge.acked(),
                    )
                    .await;
            }
            if gauge.record_ack(server_offset) {
                failures = 0;
                self.emit_progress(&gauge).await;
            }

            // The disconnect may have happened after the last byte was
            // durably written: nothing left to send, just finalize.
            if server_offset == size_bytes {
                match channel.complete(&handle.file_id).await {
                    Ok(resp) => return self.finish(&mut gauge, &handle.file_id, resp.offset).await,
                    Err(e) if e.is_retryable() => {
                        channel.close();
                        failures += 1;
                        self.emit_state(UploadState::Interrupted {
                            offset: gauge.acked(),
                        })
                        .await;
                        if failures > self.config.max_retries {
                            return self
                                .fail(
                                    ClientError::RetriesExhausted {
                                        last_offset: gauge.acked(),
                                    },
                                    gauge.acked(),
                                )
                                .await;
                        }
                        continue;
                    }
                    Err(e) => {
                        channel.close();
                        return self.fail(e, gauge.acked()).await;
                    }
                }
            }

            self.emit_state(UploadState::Streaming).await;

            // A fresh chunk source per attempt, seeked to the server's
            // offset. Sources are never resumed in place.
            let mut source =
                match ChunkSource::open(path, &handle.file_id, self.config.chunk_size).await {
                    Ok(source) => source,
                    Err(e) => {
                        channel.close();
                        return self.fail(e.into(), gauge.acked()).await;
                    }
                };
            if let Err(e) = source.seek_to(server_offset).await {
                channel.close();
                return self.fail(e.into(), gauge.acked()).await;
            }

            // Outbound chunks and inbound statuses run as two independent
            // tasks: the sender owns the channel, this task consumes the
            // status stream. A failure on either side is reported through
            // its channel/result, never by tearing the process down.
            let close_token = channel.cancel_token();
            let file_id = handle.file_id.clone();
            let mut sender_task = tokio::spawn(async move {
                loop {
                    match source.next_chunk().await {
                        Ok(Some(chunk)) => channel.send_chunk(&chunk).await?,
                        Ok(None) => break,
                        Err(e) => return Err(ClientError::from(e)),
                    }
                }
                channel.complete(&file_id).await
            });

            let outcome = loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        close_token.cancel();
                        sender_task.abort();
                        return self.cancelled().await;
                    }

                    joined = &mut sender_task => {
                        break match joined {
                            Ok(Ok(resp)) => StreamOutcome::Done(resp.offset),
                            Ok(Err(e)) => StreamOutcome::Failed(e),
                            Err(e) => {
                                tracing::error!("sender task failed: {e}");
                                StreamOutcome::Failed(ClientError::Closed)
                            }
                        };
                    }

                    event = tokio::time::timeout(self.config.status_idle_timeout, events.recv()) => {
                        match event {
                            Ok(Some(ChannelEvent::Status(status))) => {
                                if status.offset > size_bytes {
                                    break StreamOutcome::Failed(ClientError::ProtocolViolation(
                                        format!("status offset {} beyond size {size_bytes}", status.offset),
                                    ));
                                }
                                if gauge.record_ack(status.offset) {
                                    failures = 0;
                                    self.emit_progress(&gauge).await;
                                }
                            }
                            Ok(Some(ChannelEvent::Rejected { code, message })) => {
                                break StreamOutcome::Failed(ClientError::Rejected { code, message });
                            }
                            Ok(Some(ChannelEvent::Closed)) | Ok(None) => {
                                break StreamOutcome::Failed(ClientError::Closed);
                            }
                            Err(_) => break StreamOutcome::Failed(ClientError::Timeout),
                        }
                    }
                }
            };

            match outcome {
                StreamOutcome::Done(final_offset) => {
                    return self.finish(&mut gauge, &handle.file_id, final_offset).await;
                }
                StreamOutcome::Failed(e) => {
                    close_token.cancel();
                    sender_task.abort();
                    if e.is_retryable() {
                        failures += 1;
                        tracing::warn!(
                            error = %e,
                            acked = gauge.acked(),
                            failures,
                            "transfer interrupted"
                        );
                        self.emit_state(UploadState::Interrupted {
                            offset: gauge.acked(),
                        })
                        .await;
                        if failures > self.config.max_retries {
                            return self
                                .fail(
                                    ClientError::RetriesExhausted {
                                        last_offset: gauge.acked(),
                                    },
                                    gauge.acked(),
                                )
                                .await;
                        }
                        continue;
                    }
                    return self.fail(e, gauge.acked()).await;
                }
            }
        }
    }

    async fn emit_state(&self, state: UploadState) {
        let _ = self
            .events_tx
            .send(UploadEvent::StateChanged(state))
            .await;
    }

    async fn emit_progress(&self, gauge: &ProgressGauge) {
        let _ = self
            .events_tx
            .send(UploadEvent::Progress(gauge.snapshot()))
            .await;
    }

    async fn finish(
        &self,
        gauge: &mut ProgressGauge,
        file_id: &str,
        final_offset: i64,
    ) -> Result<UploadReport, ClientError> {
        gauge.record_ack(final_offset);
        self.emit_progress(gauge).await;
        self.emit_state(UploadState::Complete).await;
        let _ = self
            .events_tx
            .send(UploadEvent::Completed {
                file_id: file_id.to_string(),
                bytes: final_offset,
            })
            .await;
        tracing::info!(file_id, bytes = final_offset, "upload complete");
        Ok(UploadReport {
            file_id: file_id.to_string(),
            bytes: final_offset,
        })
    }

    async fn fail(
        &self,
        error: ClientError,
        last_offset: i64,
    ) -> Result<UploadReport, ClientError> {
        tracing::error!(%error, last_offset, "upload failed");
        self.emit_state(UploadState::Fatal).await;
        let _ = self
            .events_tx
            .send(UploadEvent::Failed {
                error: error.to_string(),
                last_offset,
            })
            .await;
        Err(error)
    }

    async fn cancelled(&self) -> Result<UploadReport, ClientError> {
        tracing::info!("upload cancelled");
        self.emit_state(UploadState::Cancelled).await;
        Err(ClientError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_config() -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_millis(300),
            max_retries: 1,
            backoff: crate::BackoffConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
                factor: 2.0,
            },
            ..ClientConfig::default()
        }
    }

    fn dead_handle(file_id: &str) -> FileHandle {
        FileHandle {
            file_id: file_id.into(),
            // Nothing listens here; any connect attempt fails fast.
            storage_address: "ws://127.0.0.1:9".into(),
            token: "t".repeat(64),
        }
    }

    async fn drain(mut rx: mpsc::Receiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn zero_byte_file_completes_without_a_channel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let (controller, events_rx) = UploadController::new(fast_config());
        let report = controller
            .run_with_handle(&dead_handle("f-empty"), &path)
            .await
            .unwrap();

        assert_eq!(report.bytes, 0);
        assert_eq!(report.file_id, "f-empty");

        let events = drain(events_rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, UploadEvent::StateChanged(UploadState::Complete))));
        assert!(events
            .iter()
            .any(|e| matches!(e, UploadEvent::Completed { bytes: 0, .. })));
        // No connection was attempted, so no Connecting state.
        assert!(!events
            .iter()
            .any(|e| matches!(e, UploadEvent::StateChanged(UploadState::Connecting { .. }))));
    }

    #[tokio::test]
    async fn missing_local_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope.bin");

        let (controller, events_rx) = UploadController::new(fast_config());
        let err = controller
            .run_with_handle(&dead_handle("f-x"), &path)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));

        let events = drain(events_rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, UploadEvent::StateChanged(UploadState::Fatal))));
        assert!(events
            .iter()
            .any(|e| matches!(e, UploadEvent::Failed { last_offset: 0, .. })));
    }

    #[tokio::test]
    async fn pre_cancelled_controller_halts_without_retry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"some data").unwrap();

        let (controller, events_rx) = UploadController::new(fast_config());
        controller.cancel_token().cancel();

        let err = controller
            .run_with_handle(&dead_handle("f-x"), &path)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));

        let events = drain(events_rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, UploadEvent::StateChanged(UploadState::Cancelled))));
        assert!(!events
            .iter()
            .any(|e| matches!(e, UploadEvent::StateChanged(UploadState::Fatal))));
    }

    #[tokio::test]
    async fn retry_budget_exhausts_against_dead_storage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"some data").unwrap();

        let (controller, events_rx) = UploadController::new(fast_config());
        let err = controller
            .run_with_handle(&dead_handle("f-x"), &path)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::RetriesExhausted { last_offset: 0 }
        ));

        let events = drain(events_rx).await;
        // Both the initial attempt and the retry show up as Connecting.
        let connects = events
            .iter()
            .filter(|e| matches!(e, UploadEvent::StateChanged(UploadState::Connecting { .. })))
            .count();
        assert_eq!(connects, 2); // max_retries = 1
        assert!(events
            .iter()
            .any(|e| matches!(e, UploadEvent::StateChanged(UploadState::Fatal))));
        assert!(events
            .iter()
            .any(|e| matches!(e, UploadEvent::Failed { last_offset: 0, .. })));
    }

    #[tokio::test]
    async fn allocation_failure_surfaces_through_run() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"payload").unwrap();

        let (controller, events_rx) = UploadController::new(fast_config());
        let err = controller
            .run("ws://127.0.0.1:9", &path)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RetriesExhausted { .. }));

        let events = drain(events_rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, UploadEvent::StateChanged(UploadState::Allocating))));
        // Allocation never succeeded, so no Granted event.
        assert!(!events.iter().any(|e| matches!(e, UploadEvent::Granted(_))));
    }
}
