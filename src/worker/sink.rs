//! Writes a job's output chunks to their destination files.
//!
//! When both streams point at the same path a single handle is opened and
//! shared, so interleaved stdout and stderr land in one file in arrival
//! order. Handles are flushed and closed on every exit path by `finish` or
//! by drop.

use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::protocol::OutputChunk;

pub struct FileSink {
    stdout: File,
    /// `None` when both streams share the stdout handle.
    stderr: Option<File>,
}

impl FileSink {
    pub async fn open(stdout_path: &str, stderr_path: &str) -> std::io::Result<Self> {
        let stdout = File::create(stdout_path).await?;
        let stderr = if stdout_path == stderr_path {
            None
        } else {
            Some(File::create(stderr_path).await?)
        };
        Ok(Self { stdout, stderr })
    }

    pub async fn write(&mut self, chunk: &OutputChunk) -> std::io::Result<()> {
        match (chunk, &mut self.stderr) {
            (OutputChunk::Stderr(data), Some(stderr)) => stderr.write_all(data).await,
            (chunk, _) => self.stdout.write_all(chunk.data()).await,
        }
    }

    pub async fn finish(mut self) -> std::io::Result<()> {
        self.stdout.flush().await?;
        if let Some(stderr) = &mut self.stderr {
            stderr.flush().await?;
        }
        Ok(())
    }
}
