//! The master's allocation handler.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use packmule_protocol::auth;
use packmule_protocol::constants::{
    ERR_CODE_BAD_REQUEST, ERR_CODE_NOT_FOUND, ERR_CODE_UNAVAILABLE, MessageType,
};
use packmule_protocol::envelope::Message;
use packmule_protocol::messages::{FileHandle, FileLocation, FileMetadata, FileQuery};
use packmule_server::{Handler, HandlerFuture, Sender};

use crate::MasterConfig;

/// Metadata the master keeps per allocated file.
#[derive(Debug, Clone)]
struct FileRecord {
    filename: String,
    size_bytes: i64,
    storage_address: String,
}

/// The master service.
pub struct MasterService {
    config: MasterConfig,
    files: RwLock<HashMap<String, FileRecord>>,
    next_node: AtomicUsize,
}

/// A failed allocation, mapped onto an envelope error reply.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct AllocationError {
    pub code: i32,
    pub message: String,
}

impl MasterService {
    pub fn new(config: MasterConfig) -> Self {
        Self {
            config,
            files: RwLock::new(HashMap::new()),
            next_node: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Number of allocated (not yet forgotten) files.
    pub fn file_count(&self) -> usize {
        self.files.read().unwrap().len()
    }

    /// Allocates a file id, storage node and token for a new upload.
    ///
    /// A zero-byte file is valid and still gets a handle; the uploader is
    /// expected to complete it without opening a chunk stream.
    pub fn allocate(&self, meta: &FileMetadata) -> Result<FileHandle, AllocationError> {
        if meta.filename.is_empty() {
            return Err(AllocationError {
                code: ERR_CODE_BAD_REQUEST,
                message: "filename is required".into(),
            });
        }
        if meta.size_bytes < 0 {
            return Err(AllocationError {
                code: ERR_CODE_BAD_REQUEST,
                message: format!("negative file size: {}", meta.size_bytes),
            });
        }
        if self.config.storage_nodes.is_empty() {
            return Err(AllocationError {
                code: ERR_CODE_UNAVAILABLE,
                message: "no storage capacity".into(),
            });
        }

        let file_id = uuid::Uuid::new_v4().to_string();
        let index = self.next_node.fetch_add(1, Ordering::Relaxed) % self.config.storage_nodes.len();
        let storage_address = self.config.storage_nodes[index].clone();
        let token = auth::mint_token(&self.config.token_secret, &file_id);

        self.files.write().unwrap().insert(
            file_id.clone(),
            FileRecord {
                filename: meta.filename.clone(),
                size_bytes: meta.size_bytes,
                storage_address: storage_address.clone(),
            },
        );

        tracing::info!(
            file_id = %file_id,
            filename = %meta.filename,
            size = meta.size_bytes,
            storage = %storage_address,
            "upload registered"
        );

        Ok(FileHandle {
            file_id,
            storage_address,
            token,
        })
    }

    /// Looks up where an allocated file lives.
    pub fn locate(&self, file_id: &str) -> Option<FileLocation> {
        let files = self.files.read().unwrap();
        files.get(file_id).map(|record| FileLocation {
            file_id: file_id.to_string(),
            filename: record.filename.clone(),
            size_bytes: record.size_bytes,
            storage_address: record.storage_address.clone(),
        })
    }
}

impl Handler for MasterService {
    fn on_request_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let meta = match msg.parse_payload::<FileMetadata>() {
                Ok(Some(meta)) => meta,
                _ => {
                    let _ = sender.send_error(&msg, ERR_CODE_BAD_REQUEST, "missing or malformed payload");
                    return;
                }
            };

            match self.allocate(&meta) {
                Ok(handle) => {
                    if let Ok(reply) = msg.reply(MessageType::UploadGranted, Some(&handle)) {
                        let _ = sender.send_msg(reply);
                    }
                }
                Err(e) => {
                    let _ = sender.send_error(&msg, e.code, &e.message);
                }
            }
        })
    }

    fn on_query_file(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let query = match msg.parse_payload::<FileQuery>() {
                Ok(Some(query)) => query,
                _ => {
                    let _ = sender.send_error(&msg, ERR_CODE_BAD_REQUEST, "missing or malformed payload");
                    return;
                }
            };

            match self.locate(&query.file_id) {
                Some(location) => {
                    if let Ok(reply) = msg.reply(MessageType::FileLocation, Some(&location)) {
                        let _ = sender.send_msg(reply);
                    }
                }
                None => {
                    let _ = sender.send_error(&msg, ERR_CODE_NOT_FOUND, "unknown file");
                }
            }
        })
    }
}
