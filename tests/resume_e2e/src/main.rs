fn main() {
    println!("Run `cargo test -p resume-e2e` to execute the end-to-end resume tests.");
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use packmule_client::{
        BackoffConfig, ChannelEvent, ClientConfig, ClientError, TransferChannel,
        UploadController, UploadEvent, UploadState,
    };
    use packmule_master::{MasterConfig, MasterService};
    use packmule_protocol::auth;
    use packmule_protocol::constants::DEFAULT_CHUNK_SIZE;
    use packmule_protocol::messages::{FileHandle, StreamOpenRequest};
    use packmule_server::{ServerConfig, WsServer};
    use packmule_storage_node::{StorageConfig, StorageNode};
    use packmule_transfer::ChunkSource;
    use tempfile::TempDir;

    const SECRET: &str = "e2e-secret";

    /// The literal resume scenario: 5 chunks of 64 KiB.
    const CHUNK: i64 = DEFAULT_CHUNK_SIZE as i64; // 65,536
    const FIVE_CHUNKS: i64 = 5 * CHUNK; // 327,680

    struct Cluster {
        storage_server: Arc<WsServer<StorageNode>>,
        storage_url: String,
        master_server: Arc<WsServer<MasterService>>,
        master_url: String,
        handles: Vec<tokio::task::JoinHandle<()>>,
    }

    impl Cluster {
        /// Starts a storage node and a master routed to it, both on
        /// loopback ephemeral ports.
        async fn start(blob_root: &Path) -> Self {
            let storage_config = StorageConfig {
                root: blob_root.to_path_buf(),
                status_every_chunks: 1,
                token_secret: SECRET.into(),
                ..StorageConfig::default()
            };
            let storage_server =
                WsServer::bind(ServerConfig { port: 0 }, StorageNode::new(storage_config))
                    .await
                    .unwrap();
            let storage_url = format!("ws://127.0.0.1:{}", storage_server.local_addr().port());

            let master_config = MasterConfig {
                port: 0,
                storage_nodes: vec![storage_url.clone()],
                token_secret: SECRET.into(),
            };
            let master_server =
                WsServer::bind(ServerConfig { port: 0 }, MasterService::new(master_config))
                    .await
                    .unwrap();
            let master_url = format!("ws://127.0.0.1:{}", master_server.local_addr().port());

            let mut handles = Vec::new();
            let s = Arc::clone(&storage_server);
            handles.push(tokio::spawn(async move { s.run().await.unwrap() }));
            let m = Arc::clone(&master_server);
            handles.push(tokio::spawn(async move { m.run().await.unwrap() }));

            Self {
                storage_server,
                storage_url,
                master_server,
                master_url,
                handles,
            }
        }

        fn handle_for(&self, file_id: &str) -> FileHandle {
            FileHandle {
                file_id: file_id.into(),
                storage_address: self.storage_url.clone(),
                token: auth::mint_token(SECRET, file_id),
            }
        }

        async fn stop(self) {
            self.master_server.shutdown();
            self.storage_server.shutdown();
            for handle in self.handles {
                handle.await.unwrap();
            }
        }
    }

    fn client_config() -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_secs(2),
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(100),
                factor: 2.0,
            },
            max_retries: 3,
            ..ClientConfig::default()
        }
    }

    /// Creates a file with deterministic, position-dependent bytes so any
    /// gap or doubled region changes the content.
    fn make_source_file(dir: &Path, name: &str, len: usize) -> PathBuf {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = dir.join(name);
        std::fs::write(&path, &data).unwrap();
        path
    }

    fn open_request(handle: &FileHandle, size: i64) -> StreamOpenRequest {
        StreamOpenRequest {
            file_id: handle.file_id.clone(),
            size_bytes: size,
            token: handle.token.clone(),
        }
    }

    async fn drain_events(rx: &mut tokio::sync::mpsc::Receiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn full_upload_end_to_end() {
        let blobs = TempDir::new().unwrap();
        let files = TempDir::new().unwrap();
        let cluster = Cluster::start(blobs.path()).await;

        let source = make_source_file(files.path(), "payload.bin", 200_000);
        let (controller, mut events_rx) = UploadController::new(client_config());
        let report = controller.run(&cluster.master_url, &source).await.unwrap();

        assert_eq!(report.bytes, 200_000);

        // The persisted blob is byte-identical to the source.
        let blob = std::fs::read(blobs.path().join(&report.file_id)).unwrap();
        let original = std::fs::read(&source).unwrap();
        assert_eq!(blob, original);

        // The master recorded the allocation.
        assert_eq!(cluster.master_server.handler().file_count(), 1);

        let events = drain_events(&mut events_rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, UploadEvent::StateChanged(UploadState::Allocating))));
        assert!(events.iter().any(|e| matches!(e, UploadEvent::Granted(_))));
        assert!(events
            .iter()
            .any(|e| matches!(e, UploadEvent::StateChanged(UploadState::Streaming))));
        assert!(events
            .iter()
            .any(|e| matches!(e, UploadEvent::Completed { bytes: 200_000, .. })));

        cluster.stop().await;
    }

    #[tokio::test]
    async fn resume_after_disconnect_at_third_chunk() {
        let blobs = TempDir::new().unwrap();
        let files = TempDir::new().unwrap();
        let cluster = Cluster::start(blobs.path()).await;

        let source = make_source_file(files.path(), "payload.bin", FIVE_CHUNKS as usize);
        let handle = cluster.handle_for("f-resume");

        // First attempt: send chunks 0..=2, wait until the storage node has
        // acknowledged 196,608 bytes, then drop the connection abruptly.
        {
            let (channel, mut events, offset) = TransferChannel::open(
                &handle.storage_address,
                &open_request(&handle, FIVE_CHUNKS),
                &client_config(),
            )
            .await
            .unwrap();
            assert_eq!(offset, 0);

            let mut chunk_source = ChunkSource::open(&source, &handle.file_id, CHUNK as usize)
                .await
                .unwrap();
            for _ in 0..3 {
                let chunk = chunk_source.next_chunk().await.unwrap().unwrap();
                channel.send_chunk(&chunk).await.unwrap();
            }

            let acked = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    match events.recv().await {
                        Some(ChannelEvent::Status(status)) if status.offset >= 3 * CHUNK => {
                            break status.offset;
                        }
                        Some(_) => continue,
                        None => panic!("channel closed before ack"),
                    }
                }
            })
            .await
            .unwrap();
            assert_eq!(acked, 196_608);
            // Dropping the channel simulates the network break.
        }

        // Second attempt: the controller reconnects, learns the resume
        // point from the first status record, and sends chunks 3..=4 only.
        let (controller, mut events_rx) = UploadController::new(client_config());
        let report = controller.run_with_handle(&handle, &source).await.unwrap();
        assert_eq!(report.bytes, FIVE_CHUNKS);

        let events = drain_events(&mut events_rx).await;

        // The first progress report is the server's resume point, not zero.
        let first_progress = events
            .iter()
            .find_map(|e| match e {
                UploadEvent::Progress(p) => Some(p.acked_bytes),
                _ => None,
            })
            .expect("expected progress events");
        assert_eq!(first_progress, 196_608);

        // Progress never regresses across the resumed attempt.
        let mut last = 0;
        for event in &events {
            if let UploadEvent::Progress(p) = event {
                assert!(p.acked_bytes >= last, "progress regressed: {last} -> {}", p.acked_bytes);
                last = p.acked_bytes;
            }
        }
        assert_eq!(last, FIVE_CHUNKS);

        // No gaps, no doubled regions: the blob equals the source exactly.
        let blob = std::fs::read(blobs.path().join("f-resume")).unwrap();
        let original = std::fs::read(&source).unwrap();
        assert_eq!(blob, original);

        cluster.stop().await;
    }

    #[tokio::test]
    async fn completion_detected_on_reconnect_without_resending() {
        let blobs = TempDir::new().unwrap();
        let files = TempDir::new().unwrap();
        let cluster = Cluster::start(blobs.path()).await;

        let size = 2 * CHUNK;
        let source = make_source_file(files.path(), "payload.bin", size as usize);
        let handle = cluster.handle_for("f-done");

        // Send every chunk, wait for the full ack, then vanish before
        // sending complete_upload: the classic lost-completion race.
        {
            let (channel, mut events, _) = TransferChannel::open(
                &handle.storage_address,
                &open_request(&handle, size),
                &client_config(),
            )
            .await
            .unwrap();

            let mut chunk_source = ChunkSource::open(&source, &handle.file_id, CHUNK as usize)
                .await
                .unwrap();
            while let Some(chunk) = chunk_source.next_chunk().await.unwrap() {
                channel.send_chunk(&chunk).await.unwrap();
            }

            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    match events.recv().await {
                        Some(ChannelEvent::Status(status)) if status.offset == size => break,
                        Some(_) => continue,
                        None => panic!("channel closed before full ack"),
                    }
                }
            })
            .await
            .unwrap();
        }

        // The controller's reconnect sees offset == size and completes
        // without streaming a single byte.
        let (controller, mut events_rx) = UploadController::new(client_config());
        let report = controller.run_with_handle(&handle, &source).await.unwrap();
        assert_eq!(report.bytes, size);

        let events = drain_events(&mut events_rx).await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, UploadEvent::StateChanged(UploadState::Streaming))));
        assert!(events
            .iter()
            .any(|e| matches!(e, UploadEvent::StateChanged(UploadState::Complete))));

        cluster.stop().await;
    }

    #[tokio::test]
    async fn duplicate_chunks_do_not_corrupt_or_error() {
        let blobs = TempDir::new().unwrap();
        let files = TempDir::new().unwrap();
        let cluster = Cluster::start(blobs.path()).await;

        let size = 2 * CHUNK;
        let source = make_source_file(files.path(), "payload.bin", size as usize);
        let handle = cluster.handle_for("f-dup");

        let (channel, mut events, _) = TransferChannel::open(
            &handle.storage_address,
            &open_request(&handle, size),
            &client_config(),
        )
        .await
        .unwrap();

        // Send chunk 0, wait for its ack.
        let mut chunk_source = ChunkSource::open(&source, &handle.file_id, CHUNK as usize)
            .await
            .unwrap();
        let first = chunk_source.next_chunk().await.unwrap().unwrap();
        channel.send_chunk(&first).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(ChannelEvent::Status(status)) if status.offset >= CHUNK => break,
                    Some(ChannelEvent::Rejected { code, message }) => {
                        panic!("unexpected rejection {code}: {message}")
                    }
                    Some(_) => continue,
                    None => panic!("channel closed"),
                }
            }
        })
        .await
        .unwrap();

        // Replay chunk 0 (a stale retransmit), then continue normally.
        channel.send_chunk(&first).await.unwrap();
        let second = chunk_source.next_chunk().await.unwrap().unwrap();
        channel.send_chunk(&second).await.unwrap();

        let resp = channel.complete(&handle.file_id).await.unwrap();
        assert_eq!(resp.offset, size);

        let blob = std::fs::read(blobs.path().join("f-dup")).unwrap();
        assert_eq!(blob, std::fs::read(&source).unwrap());

        cluster.stop().await;
    }

    #[tokio::test]
    async fn zero_byte_upload_completes_through_master() {
        let blobs = TempDir::new().unwrap();
        let files = TempDir::new().unwrap();
        let cluster = Cluster::start(blobs.path()).await;

        let source = files.path().join("empty.bin");
        std::fs::write(&source, b"").unwrap();

        let (controller, mut events_rx) = UploadController::new(client_config());
        let report = controller.run(&cluster.master_url, &source).await.unwrap();
        assert_eq!(report.bytes, 0);

        // The handle was allocated, but no chunk stream ever opened and no
        // blob was created.
        assert_eq!(cluster.master_server.handler().file_count(), 1);
        assert!(!blobs.path().join(&report.file_id).exists());
        assert!(cluster.storage_server.handler().registry().is_empty());

        let events = drain_events(&mut events_rx).await;
        assert!(events.iter().any(|e| matches!(e, UploadEvent::Granted(_))));
        assert!(!events
            .iter()
            .any(|e| matches!(e, UploadEvent::StateChanged(UploadState::Connecting { .. }))));

        cluster.stop().await;
    }

    #[tokio::test]
    async fn cancellation_stops_upload_and_partial_data_resumes_later() {
        let blobs = TempDir::new().unwrap();
        let files = TempDir::new().unwrap();
        let cluster = Cluster::start(blobs.path()).await;

        let size = 40 * CHUNK; // large enough to cancel mid-flight
        let source = make_source_file(files.path(), "big.bin", size as usize);
        let handle = cluster.handle_for("f-cancel");

        let (controller, mut events_rx) = UploadController::new(client_config());
        let cancel = controller.cancel_token();

        let run = {
            let handle = handle.clone();
            let source = source.clone();
            async move { controller.run_with_handle(&handle, &source).await }
        };
        let runner = tokio::spawn(run);

        // Cancel as soon as some progress is acknowledged.
        let acked_at_cancel = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events_rx.recv().await {
                    Some(UploadEvent::Progress(p)) if p.acked_bytes > 0 => {
                        cancel.cancel();
                        break p.acked_bytes;
                    }
                    Some(_) => continue,
                    None => panic!("event stream ended early"),
                }
            }
        })
        .await
        .unwrap();

        let err = runner.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));

        // Terminal state is Cancelled, not Fatal, and no retry follows.
        let mut saw_cancelled = false;
        while let Some(event) = events_rx.recv().await {
            match event {
                UploadEvent::StateChanged(UploadState::Cancelled) => saw_cancelled = true,
                UploadEvent::StateChanged(UploadState::Fatal) => panic!("cancel must not be fatal"),
                _ => {}
            }
        }
        assert!(saw_cancelled);

        // A later run with the same handle resumes from the durable prefix
        // and finishes the file intact.
        let (controller, _events_rx) = UploadController::new(client_config());
        let report = controller.run_with_handle(&handle, &source).await.unwrap();
        assert_eq!(report.bytes, size);
        assert!(acked_at_cancel < size);

        let blob = std::fs::read(blobs.path().join("f-cancel")).unwrap();
        assert_eq!(blob, std::fs::read(&source).unwrap());

        cluster.stop().await;
    }

    #[tokio::test]
    async fn invalid_token_fails_without_retry() {
        let blobs = TempDir::new().unwrap();
        let files = TempDir::new().unwrap();
        let cluster = Cluster::start(blobs.path()).await;

        let source = make_source_file(files.path(), "payload.bin", 1024);
        let mut handle = cluster.handle_for("f-auth");
        handle.token = "0".repeat(64);

        let (controller, mut events_rx) = UploadController::new(client_config());
        let err = controller.run_with_handle(&handle, &source).await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected { code: 401, .. }));

        let events = drain_events(&mut events_rx).await;
        let connects = events
            .iter()
            .filter(|e| matches!(e, UploadEvent::StateChanged(UploadState::Connecting { .. })))
            .count();
        assert_eq!(connects, 1, "auth failure must not be retried");
        assert!(events
            .iter()
            .any(|e| matches!(e, UploadEvent::StateChanged(UploadState::Fatal))));

        cluster.stop().await;
    }

    #[tokio::test]
    async fn concurrent_uploads_do_not_interfere() {
        let blobs = TempDir::new().unwrap();
        let files = TempDir::new().unwrap();
        let cluster = Cluster::start(blobs.path()).await;

        let source_a = make_source_file(files.path(), "a.bin", 150_000);
        let source_b = make_source_file(files.path(), "b.bin", 90_000);

        let (controller_a, _events_a) = UploadController::new(client_config());
        let (controller_b, _events_b) = UploadController::new(client_config());

        let (report_a, report_b) = tokio::join!(
            controller_a.run(&cluster.master_url, &source_a),
            controller_b.run(&cluster.master_url, &source_b),
        );
        let report_a = report_a.unwrap();
        let report_b = report_b.unwrap();

        assert_ne!(report_a.file_id, report_b.file_id);
        assert_eq!(report_a.bytes, 150_000);
        assert_eq!(report_b.bytes, 90_000);

        let blob_a = std::fs::read(blobs.path().join(&report_a.file_id)).unwrap();
        let blob_b = std::fs::read(blobs.path().join(&report_b.file_id)).unwrap();
        assert_eq!(blob_a, std::fs::read(&source_a).unwrap());
        assert_eq!(blob_b, std::fs::read(&source_b).unwrap());

        cluster.stop().await;
    }

    #[tokio::test]
    async fn query_offset_matches_status_stream() {
        let blobs = TempDir::new().unwrap();
        let files = TempDir::new().unwrap();
        let cluster = Cluster::start(blobs.path()).await;

        let size = 2 * CHUNK;
        let source = make_source_file(files.path(), "payload.bin", size as usize);
        let handle = cluster.handle_for("f-query");

        let (channel, mut events, _) = TransferChannel::open(
            &handle.storage_address,
            &open_request(&handle, size),
            &client_config(),
        )
        .await
        .unwrap();

        let mut chunk_source = ChunkSource::open(&source, &handle.file_id, CHUNK as usize)
            .await
            .unwrap();
        let chunk = chunk_source.next_chunk().await.unwrap().unwrap();
        channel.send_chunk(&chunk).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(ChannelEvent::Status(status)) if status.offset >= CHUNK => break,
                    Some(_) => continue,
                    None => panic!("channel closed"),
                }
            }
        })
        .await
        .unwrap();

        // The fresh-query path agrees with the push stream.
        let status = channel.query_offset(&handle.file_id).await.unwrap();
        assert_eq!(status.offset, CHUNK);

        cluster.stop().await;
    }
}
