//! Awaitable whole-file transfers on top of the chunk operations.

use tokio::sync::oneshot;
use tracing::{info, warn};

use busfile_protocol::{MAX_READ_CHUNK, MAX_WRITE_CHUNK};

use crate::{ClientError, FileClient, TransferMode};

impl FileClient {
    /// Writes `data` to `path` on the remote and closes the stream.
    ///
    /// Each chunk waits for its acknowledgment before the next is sent. On
    /// any failure the transfer is aborted so the client can be reused.
    pub async fn upload(&self, path: &str, data: &[u8]) -> Result<(), ClientError> {
        if data.is_empty() {
            return Err(ClientError::EmptyChunk);
        }
        self.open(path, TransferMode::Write)?;
        let result = self.upload_chunks(data).await;
        match &result {
            Ok(()) => info!(path, len = data.len(), "upload complete"),
            Err(e) => {
                warn!(path, error = %e, "upload failed");
                self.abort();
            }
        }
        result
    }

    /// Reads `path` from the remote until a short chunk ends the stream.
    pub async fn download(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        self.open(path, TransferMode::Read)?;
        let result = self.download_chunks().await;
        match &result {
            Ok(content) => {
                self.close(None)?;
                info!(path, len = content.len(), "download complete");
            }
            Err(e) => {
                warn!(path, error = %e, "download failed");
                self.abort();
            }
        }
        result
    }

    async fn upload_chunks(&self, data: &[u8]) -> Result<(), ClientError> {
        for chunk in data.chunks(MAX_WRITE_CHUNK) {
            let (tx, rx) = oneshot::channel();
            self.write(
                chunk,
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            )?;
            self.wait(rx).await?;
        }

        let (tx, rx) = oneshot::channel();
        self.close(Some(Box::new(move |result| {
            let _ = tx.send(result);
        })))?;
        self.wait(rx).await
    }

    async fn download_chunks(&self) -> Result<Vec<u8>, ClientError> {
        let mut content = Vec::new();
        loop {
            let (tx, rx) = oneshot::channel();
            self.read(Box::new(move |result| {
                let _ = tx.send(result);
            }))?;
            let chunk = self.wait(rx).await?;
            content.extend_from_slice(&chunk);
            if chunk.len() < MAX_READ_CHUNK {
                return Ok(content);
            }
        }
    }

    async fn wait<T>(
        &self,
        rx: oneshot::Receiver<Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        match tokio::time::timeout(self.config().response_timeout, rx).await {
            Ok(Ok(result)) => result,
            // Completion dropped unresolved.
            Ok(Err(_)) => Err(ClientError::Aborted),
            Err(_) => Err(ClientError::Timeout),
        }
    }
}
