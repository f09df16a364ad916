use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use super::FlashError;

/// Digests of the firmware image and of the same extent read back from the card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumRecord {
    pub source_digest: String,
    pub target_digest: String,
    /// Size of the source image, the number of bytes that should have been compared
    pub expected_bytes: u64,
    pub bytes_read: u64,
}

impl ChecksumRecord {
    pub fn matches(&self) -> bool {
        self.bytes_read == self.expected_bytes && self.source_digest == self.target_digest
    }

    pub fn is_short_read(&self) -> bool {
        self.bytes_read < self.expected_bytes
    }

    pub fn mismatch_error(&self) -> Option<FlashError> {
        (!self.matches()).then(|| FlashError::ChecksumMismatch {
            source_digest: self.source_digest.clone(),
            target_digest: self.target_digest.clone(),
        })
    }
}

/// SHA-256 of a whole file, with its length.
pub fn sha256_file(path: &Path, chunk_size: usize) -> Result<(String, u64), FlashError> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => FlashError::SourceFileMissing(path.to_path_buf()),
        io::ErrorKind::PermissionDenied => FlashError::PermissionDenied(path.display().to_string()),
        _ => FlashError::IoError(e),
    })?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((format!("{:x}", hasher.finalize()), total))
}

fn target_error(target: &str, err: io::Error) -> FlashError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => FlashError::PermissionDenied(target.to_string()),
        // ENXIO/ENODEV/EIO all surface as Other or Uncategorized once the card is pulled.
        _ => FlashError::DeviceDisconnected(format!("{target}: {err}")),
    }
}

/// SHA-256 over the first `len` bytes of a device node or file. Returns the
/// digest and the number of bytes actually read.
///
/// A read that ends early is an error when less than `threshold` of `len`
/// came back; otherwise it is logged and the digest of what was read is
/// returned, which will not match the source.
pub fn sha256_prefix(
    target: &str,
    len: u64,
    chunk_size: usize,
    threshold: f64,
) -> Result<(String, u64), FlashError> {
    let mut file = File::open(target).map_err(|e| target_error(target, e))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size];
    let mut read = 0u64;
    while read < len {
        let want = (len - read).min(chunk_size as u64) as usize;
        let n = match file.read(&mut buf[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(target_error(target, e)),
        };
        hasher.update(&buf[..n]);
        read += n as u64;
    }

    if read < len {
        let fraction = read as f64 / len as f64;
        if fraction < threshold {
            return Err(FlashError::PartialRead {
                path: target.to_string(),
                read,
                expected: len,
            });
        }
        log::warn!(
            "Short read from {target}: {read} of {len} bytes ({:.1}%), comparing what was read",
            fraction * 100.0
        );
    }

    Ok((format!("{:x}", hasher.finalize()), read))
}

/// Compare the source image against the extent written to `target`.
pub fn verify(
    source: &Path,
    target: &str,
    chunk_size: usize,
    threshold: f64,
) -> Result<ChecksumRecord, FlashError> {
    let (source_digest, expected_bytes) = sha256_file(source, chunk_size)?;
    log::debug!("Source {} sha256={source_digest} ({expected_bytes} bytes)", source.display());

    let (target_digest, bytes_read) = sha256_prefix(target, expected_bytes, chunk_size, threshold)?;
    log::debug!("Target {target} sha256={target_digest} ({bytes_read} bytes)");

    Ok(ChecksumRecord {
        source_digest,
        target_digest,
        expected_bytes,
        bytes_read,
    })
}
