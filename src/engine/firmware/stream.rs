//! Firmware transfer handle.

use futures_util::stream::{self, Stream};
use std::io;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::FirmwareImage;

const CHUNK_SIZE: usize = 16 * 1024;

/// An opened firmware blob together with the metadata it was opened under.
///
/// The file handle pins the bytes: a publish that lands while this is being
/// streamed swaps the canonical slot, but this handle keeps reading the
/// image it was opened against.
#[derive(Debug)]
pub struct FirmwareDownload {
    pub image: FirmwareImage,
    file: File,
}

impl FirmwareDownload {
    pub(crate) fn new(image: FirmwareImage, file: File) -> Self {
        Self { image, file }
    }

    /// Chunked byte stream over the blob; nothing is buffered beyond one chunk
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Vec<u8>>> + Send + 'static {
        stream::try_unfold(self.file, next_chunk)
    }

    /// Read the whole blob into memory
    pub async fn read_all(mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.image.size as usize);
        self.file.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

async fn next_chunk(mut file: File) -> io::Result<Option<(Vec<u8>, File)>> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let n = file.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some((buf, file)))
}
