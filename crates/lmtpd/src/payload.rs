use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Message bodies up to this size stay in memory; the first append
/// that would exceed it moves the whole payload to an unlinked temp
/// file.
pub const MAIL_DATA_MAX_INMEMORY_SIZE: usize = 64 * 1024;

/// Accumulates the DATA body. `tempfile::tempfile_in` hands back a
/// file that never had a linked name, so an aborted session leaks
/// nothing into the filesystem; closing the fd releases the storage.
#[derive(Debug)]
pub enum PayloadSink {
    InMemory { buffer: Vec<u8>, temp_dir: PathBuf },
    Spilled { file: std::fs::File, bytes: u64 },
}

impl PayloadSink {
    pub fn new(temp_dir: &Path) -> Self {
        Self::InMemory {
            buffer: Vec::with_capacity(8 * 1024),
            temp_dir: temp_dir.to_path_buf(),
        }
    }

    /// Appends below the ceiling are plain buffer extends; anything
    /// that touches the spill file runs on the blocking pool so the
    /// session task yields instead of stalling a runtime worker.
    pub async fn append(&mut self, data: &[u8]) -> std::io::Result<()> {
        if let Self::InMemory { buffer, .. } = self {
            if buffer.len() + data.len() <= MAIL_DATA_MAX_INMEMORY_SIZE {
                buffer.extend_from_slice(data);
                return Ok(());
            }
        }
        // The sink is rebuilt from the blocking task's result. A
        // failed write leaves an empty sink behind, which is fine:
        // sink errors destroy the session.
        let state = std::mem::replace(
            self,
            Self::InMemory {
                buffer: Vec::new(),
                temp_dir: PathBuf::new(),
            },
        );
        let chunk = data.to_vec();
        let (file, bytes) = tokio::task::spawn_blocking(
            move || -> std::io::Result<(std::fs::File, u64)> {
                match state {
                    Self::InMemory { buffer, temp_dir } => {
                        let mut file = tempfile::tempfile_in(&temp_dir)?;
                        file.write_all(&buffer)?;
                        file.write_all(&chunk)?;
                        Ok((file, buffer.len() as u64 + chunk.len() as u64))
                    }
                    Self::Spilled { mut file, bytes } => {
                        file.write_all(&chunk)?;
                        Ok((file, bytes + chunk.len() as u64))
                    }
                }
            },
        )
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))??;
        *self = Self::Spilled { file, bytes };
        Ok(())
    }

    pub fn len(&self) -> u64 {
        match self {
            Self::InMemory { buffer, .. } => buffer.len() as u64,
            Self::Spilled { bytes, .. } => *bytes,
        }
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self, Self::Spilled { .. })
    }

    pub fn finish(self) -> PayloadBody {
        match self {
            Self::InMemory { buffer, .. } => PayloadBody::InMemory(buffer),
            Self::Spilled { file, bytes } => PayloadBody::Spilled { file, bytes },
        }
    }
}

/// The completed body, readable any number of times during fan-out.
#[derive(Debug)]
pub enum PayloadBody {
    InMemory(Vec<u8>),
    Spilled { file: std::fs::File, bytes: u64 },
}

impl PayloadBody {
    pub fn len(&self) -> u64 {
        match self {
            Self::InMemory(buffer) => buffer.len() as u64,
            Self::Spilled { bytes, .. } => *bytes,
        }
    }

    pub fn open_reader(&self) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>> {
        match self {
            Self::InMemory(buffer) => Ok(Box::new(std::io::Cursor::new(buffer.clone()))),
            Self::Spilled { file, .. } => {
                let mut file = file.try_clone()?;
                file.seek(SeekFrom::Start(0))?;
                Ok(Box::new(tokio::fs::File::from_std(file)))
            }
        }
    }
}

/// The payload as handed to delivery: the synthesized trace header
/// block followed by the body bytes.
#[derive(Debug)]
pub struct ComposedMail {
    pub headers: String,
    pub body: PayloadBody,
}

impl ComposedMail {
    pub fn len(&self) -> u64 {
        self.headers.len() as u64 + self.body.len()
    }

    pub fn open_reader(&self) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>> {
        let headers = std::io::Cursor::new(self.headers.clone().into_bytes());
        Ok(Box::new(headers.chain(self.body.open_reader()?)))
    }

    pub async fn read_to_vec(&self) -> anyhow::Result<Vec<u8>> {
        let mut reader = self.open_reader()?;
        let mut data = Vec::with_capacity(self.len() as usize);
        reader.read_to_end(&mut data).await?;
        Ok(data)
    }
}
