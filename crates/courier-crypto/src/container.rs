//! On-disk container for an encrypted file.
//!
//! Layout:
//! ```text
//! "COURIER\x01"                        8-byte magic
//! chunk ciphertexts, in index order      empty for whole-buffer files
//! EncryptedFile JSON                     chunk entries carry no ciphertext
//! trailer length                         u64 BE
//! ```
//! The JSON goes last because the master tag only exists once every chunk
//! is sealed. Writing streams each chunk out as it is encrypted; reading
//! loads the trailer, verifies the manifest, then decrypts one chunk at a
//! time. Neither side buffers more than a chunk of a large file.

use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use courier_core::{CourierError, CourierResult, ProgressFn};

use crate::chunk::{decrypt_reader_chunked_to, encrypt_reader_chunked_to};
use crate::file::{file_name_of, guess_file_type, seal_whole, select_file_path, EncryptedFile, FilePath};
use crate::keys::KeyMaterial;

pub const CONTAINER_MAGIC: &[u8; 8] = b"COURIER\x01";

const LEN_SIZE: u64 = 8;

/// Largest trailer accepted when reading
pub const MAX_TRAILER_LEN: u64 = 256 * 1024 * 1024;

fn malformed(what: &str) -> CourierError {
    CourierError::Envelope(format!("encrypted file container: {what}"))
}

/// Encrypt `path` into `writer` as a container, choosing the path by size.
///
/// Returns the container's trailer (the manifest, without ciphertext).
pub async fn seal_file_to<W: AsyncWrite + Unpin>(
    path: &Path,
    material: &KeyMaterial,
    threshold: u64,
    writer: &mut W,
    progress: Option<&ProgressFn>,
    cancel: Option<&CancellationToken>,
) -> CourierResult<EncryptedFile> {
    let mut source = tokio::fs::File::open(path).await?;
    let size = source.metadata().await?.len();
    writer.write_all(CONTAINER_MAGIC).await?;

    let file = match select_file_path(size, threshold) {
        FilePath::WholeBuffer => EncryptedFile::Whole(seal_whole(path, size, material, progress).await?),
        FilePath::Chunked => EncryptedFile::Chunked(
            encrypt_reader_chunked_to(
                &mut source,
                size,
                &file_name_of(path),
                guess_file_type(path),
                material,
                writer,
                progress,
                cancel,
            )
            .await?,
        ),
    };

    let trailer = file.to_json()?;
    writer.write_all(trailer.as_bytes()).await?;
    writer.write_all(&(trailer.len() as u64).to_be_bytes()).await?;
    writer.flush().await?;
    debug!(file = %file.file_name(), size, trailer = trailer.len(), "sealed file container");
    Ok(file)
}

/// Read and check a container's trailer. Leaves the reader position unspecified.
pub async fn read_trailer<R: AsyncRead + AsyncSeek + Unpin>(reader: &mut R) -> CourierResult<EncryptedFile> {
    let total = reader.seek(SeekFrom::End(0)).await?;
    let header = CONTAINER_MAGIC.len() as u64;
    if total < header + LEN_SIZE {
        return Err(malformed("too short"));
    }

    reader.seek(SeekFrom::Start(0)).await?;
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).await?;
    if &magic != CONTAINER_MAGIC {
        return Err(malformed("not a courier container"));
    }

    reader.seek(SeekFrom::Start(total - LEN_SIZE)).await?;
    let len = reader.read_u64().await?;
    let body_end = total - LEN_SIZE;
    if len > MAX_TRAILER_LEN || len > body_end - header {
        return Err(malformed("bad trailer length"));
    }
    let trailer_start = body_end - len;

    reader.seek(SeekFrom::Start(trailer_start)).await?;
    let mut trailer = vec![0u8; len as usize];
    reader.read_exact(&mut trailer).await?;
    let json = std::str::from_utf8(&trailer).map_err(|_| malformed("trailer is not UTF-8"))?;
    let file = EncryptedFile::from_json(json)?;

    let expected_body = match &file {
        EncryptedFile::Whole(_) => 0,
        EncryptedFile::Chunked(manifest) => manifest
            .chunks
            .iter()
            .try_fold(0u64, |sum, c| sum.checked_add(c.encrypted_size))
            .ok_or(CourierError::FileIntegrity)?,
    };
    if trailer_start - header != expected_body {
        return Err(CourierError::FileIntegrity);
    }
    Ok(file)
}

/// Verify and decrypt a container into `writer`.
///
/// Returns the trailer and the plaintext bytes written. A chunk failing
/// after earlier chunks were written leaves that output in `writer`; callers
/// writing to disk should stage it and discard it on error.
pub async fn open_file_from<R, W>(
    reader: &mut R,
    material: &KeyMaterial,
    writer: &mut W,
    progress: Option<&ProgressFn>,
    cancel: Option<&CancellationToken>,
) -> CourierResult<(EncryptedFile, u64)>
where
    R: AsyncRead + AsyncSeek + Unpin,
    W: AsyncWrite + Unpin,
{
    let file = read_trailer(reader).await?;
    let written = match &file {
        EncryptedFile::Whole(_) => file.decrypt_to(material, writer, progress, cancel).await?,
        EncryptedFile::Chunked(manifest) => {
            reader
                .seek(SeekFrom::Start(CONTAINER_MAGIC.len() as u64))
                .await?;
            decrypt_reader_chunked_to(manifest, material, reader, writer, progress, cancel).await?
        }
    };
    Ok((file, written))
}
