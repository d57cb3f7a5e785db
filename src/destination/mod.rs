//! Where remuxed bytes end up
//!
//! A [`Destination`] never fails a write outright: a failed upload chunk is
//! retried once over a fresh connection, then optionally redirected to a
//! local file, and otherwise the destination turns into `Failed` and drops
//! (and counts) everything after that.

use std::fmt;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, Digest, CRC_32_ISO_HDLC};
use tracing::{error, info, warn};

use crate::config::UploadConfig;
use crate::error::{DestinationError, SwitchError, UploadError};
use crate::upload::{resolve, UploadClient};

static CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A destination as requested by a caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationSpec {
    LocalFile {
        path: PathBuf,
        /// Circular file: writing returns to offset 0 after this many bytes
        wrap_at: Option<u64>,
    },
    RemoteUpload {
        /// `host` or `host:port`
        server: String,
        filename: String,
        upload_id: u32,
        wrap_at: Option<u64>,
    },
    Discard,
}

impl DestinationSpec {
    pub fn wrap_at(&self) -> Option<u64> {
        match self {
            DestinationSpec::LocalFile { wrap_at, .. } | DestinationSpec::RemoteUpload { wrap_at, .. } => {
                *wrap_at
            }
            DestinationSpec::Discard => None,
        }
    }

    /// Same destination with `.<n>` inserted before the file extension.
    pub fn rotated(&self, n: u32) -> Self {
        match self {
            DestinationSpec::LocalFile { path, wrap_at } => DestinationSpec::LocalFile {
                path: numbered(path, n),
                wrap_at: *wrap_at,
            },
            DestinationSpec::RemoteUpload {
                server,
                filename,
                upload_id,
                wrap_at,
            } => DestinationSpec::RemoteUpload {
                server: server.clone(),
                filename: numbered(Path::new(filename), n).to_string_lossy().into_owned(),
                upload_id: *upload_id,
                wrap_at: *wrap_at,
            },
            DestinationSpec::Discard => DestinationSpec::Discard,
        }
    }
}

impl fmt::Display for DestinationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationSpec::LocalFile { path, .. } => write!(f, "file:{}", path.display()),
            DestinationSpec::RemoteUpload {
                server,
                filename,
                upload_id,
                ..
            } => write!(f, "upload:{server}/{filename}#{upload_id}"),
            DestinationSpec::Discard => f.write_str("discard"),
        }
    }
}

fn numbered(path: &Path, n: u32) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.{n}.{}", ext.to_string_lossy()),
        None => format!("{stem}.{n}"),
    };
    path.with_file_name(name)
}

enum Sink {
    LocalFile { path: PathBuf, file: File, position: u64 },
    RemoteUpload(UploadClient),
    Discard,
    Failed { reason: String },
}

/// The open, current destination
pub struct Destination {
    sink: Sink,
    label: String,
    wrap_at: Option<u64>,
    fallback_to_file: bool,
    written: u64,
    dropped: u64,
    digest: Digest<'static, u32>,
}

impl Destination {
    /// Open `spec`. When `upload.fallback_to_file` is set, an upload the
    /// server refuses or cannot be reached for is recorded to a local file
    /// named like the upload instead.
    pub fn open(spec: &DestinationSpec, upload: &UploadConfig) -> Result<Self, DestinationError> {
        Self::open_inner(spec, upload, upload.fallback_to_file)
    }

    fn open_inner(
        spec: &DestinationSpec,
        upload: &UploadConfig,
        allow_fallback: bool,
    ) -> Result<Self, DestinationError> {
        let (sink, label) = match spec {
            DestinationSpec::LocalFile { path, .. } => (open_file(path)?, spec.to_string()),
            DestinationSpec::RemoteUpload {
                server,
                filename,
                upload_id,
                ..
            } => match start_upload(server, filename, *upload_id, upload) {
                Ok(Some(client)) => (Sink::RemoteUpload(client), spec.to_string()),
                outcome if allow_fallback => {
                    let reason = match outcome {
                        Err(e) => e.to_string(),
                        Ok(_) => "upload refused".to_string(),
                    };
                    warn!(server = %server, filename = %filename, "recording to a local file instead: {reason}");
                    let path = Path::new(filename);
                    (open_file(path)?, format!("file:{}", path.display()))
                }
                Ok(None) => {
                    return Err(DestinationError::Rejected {
                        server: server.clone(),
                        filename: filename.clone(),
                    });
                }
                Err(e) => return Err(e.into()),
            },
            DestinationSpec::Discard => (Sink::Discard, spec.to_string()),
        };
        let destination = Self {
            sink,
            label,
            wrap_at: spec.wrap_at().filter(|&n| n > 0),
            fallback_to_file: upload.fallback_to_file,
            written: 0,
            dropped: 0,
            digest: CHECKSUM.digest(),
        };
        info!(destination = %destination.label, "destination opened");
        Ok(destination)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Bytes accepted since this destination was opened
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Bytes thrown away after the destination failed
    pub fn bytes_dropped(&self) -> u64 {
        self.dropped
    }

    /// CRC-32 of every accepted byte, in order
    pub fn checksum(&self) -> u32 {
        self.digest.clone().finalize()
    }

    pub fn failure(&self) -> Option<&str> {
        match &self.sink {
            Sink::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Write one staged transfer. Returns whether the bytes were accepted.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> bool {
        if chunk.is_empty() {
            return true;
        }
        let result = match &mut self.sink {
            Sink::LocalFile { path, file, position } => {
                write_local(file, position, self.wrap_at, chunk).or_else(|e| {
                    warn!(path = %path.display(), "file write failed, retrying: {e}");
                    write_local(file, position, self.wrap_at, chunk)
                })
                .map_err(|e| format!("write to {} failed: {e}", path.display()))
            }
            Sink::RemoteUpload(client) => match client.upload_chunk(chunk, self.wrap_at) {
                Ok(_) => Ok(()),
                Err(first) => {
                    warn!(server = client.server(), "upload chunk failed, reconnecting: {first}");
                    retry_upload(client, chunk, self.wrap_at)
                }
            },
            Sink::Discard => Ok(()),
            Sink::Failed { .. } => {
                self.dropped += chunk.len() as u64;
                return false;
            }
        };

        match result {
            Ok(()) => {
                self.accept(chunk);
                true
            }
            Err(reason) => self.recover(chunk, reason),
        }
    }

    fn accept(&mut self, chunk: &[u8]) {
        self.written += chunk.len() as u64;
        self.digest.update(chunk);
    }

    /// The sink gave up on `chunk`: move to a local file or to `Failed`.
    fn recover(&mut self, chunk: &[u8], reason: String) -> bool {
        if let Sink::RemoteUpload(client) = &self.sink {
            if self.fallback_to_file {
                let path = PathBuf::from(client.filename());
                match open_file(&path) {
                    Ok(mut sink) => {
                        warn!(path = %path.display(), "upload lost, continuing in a local file: {reason}");
                        let written = match &mut sink {
                            Sink::LocalFile { file, position, .. } => {
                                write_local(file, position, self.wrap_at, chunk).is_ok()
                            }
                            _ => false,
                        };
                        if written {
                            self.replace_sink(sink);
                            self.label = format!("file:{}", path.display());
                            self.accept(chunk);
                            return true;
                        }
                    }
                    Err(e) => warn!("fallback file unavailable: {e}"),
                }
            }
        }
        error!(destination = %self.label, "destination failed: {reason}");
        self.replace_sink(Sink::Failed { reason });
        self.dropped += chunk.len() as u64;
        false
    }

    fn replace_sink(&mut self, sink: Sink) {
        let mut old = std::mem::replace(&mut self.sink, sink);
        close_sink(&mut old);
    }

    /// Make `spec` the current destination. Remote-to-remote on the same
    /// server address switches the existing upload session; anything else opens a
    /// new destination first and closes this one after. On error nothing
    /// changes.
    pub fn commit_switch(&mut self, spec: &DestinationSpec, upload: &UploadConfig) -> Result<(), SwitchError> {
        let same_server = match (&mut self.sink, spec) {
            (
                Sink::RemoteUpload(client),
                DestinationSpec::RemoteUpload {
                    server,
                    filename,
                    upload_id,
                    ..
                },
            ) if resolve(server, upload.port).is_ok_and(|addr| addr == client.addr()) => {
                Some(client.switch_to(filename, *upload_id))
            }
            _ => None,
        };
        if let Some(outcome) = same_server {
            return match outcome {
                Ok(true) => {
                    self.label = spec.to_string();
                    self.wrap_at = spec.wrap_at().filter(|&n| n > 0);
                    self.reset_counters();
                    Ok(())
                }
                Ok(false) => Err(SwitchError::Rejected(format!("upload server refused {spec}"))),
                Err(e) => Err(SwitchError::Destination(e.into())),
            };
        }

        let next = match Self::open_inner(spec, upload, false) {
            Ok(next) => next,
            Err(e @ DestinationError::Rejected { .. }) => return Err(SwitchError::Rejected(e.to_string())),
            Err(e) => return Err(e.into()),
        };
        let mut old = std::mem::replace(self, next);
        old.finish();
        Ok(())
    }

    fn reset_counters(&mut self) {
        self.written = 0;
        self.dropped = 0;
        self.digest = CHECKSUM.digest();
    }

    /// Flush and close. Best effort; the destination discards afterwards.
    pub fn finish(&mut self) {
        let mut sink = std::mem::replace(&mut self.sink, Sink::Discard);
        close_sink(&mut sink);
        info!(
            destination = %self.label,
            bytes = self.written,
            dropped = self.dropped,
            "destination closed"
        );
    }
}

fn open_file(path: &Path) -> Result<Sink, DestinationError> {
    let file = File::create(path).map_err(|source| DestinationError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(Sink::LocalFile {
        path: path.to_path_buf(),
        file,
        position: 0,
    })
}

fn write_local(file: &mut File, position: &mut u64, wrap_at: Option<u64>, chunk: &[u8]) -> std::io::Result<()> {
    if wrap_at.is_some_and(|limit| *position >= limit) {
        file.seek(SeekFrom::Start(0))?;
        *position = 0;
    } else {
        file.seek(SeekFrom::Start(*position))?;
    }
    file.write_all(chunk)?;
    *position += chunk.len() as u64;
    Ok(())
}

fn start_upload(
    server: &str,
    filename: &str,
    upload_id: u32,
    upload: &UploadConfig,
) -> Result<Option<UploadClient>, UploadError> {
    let mut client = UploadClient::connect(server, upload)?;
    Ok(client.start(filename, upload_id)?.then_some(client))
}

fn retry_upload(client: &mut UploadClient, chunk: &[u8], wrap_at: Option<u64>) -> Result<(), String> {
    match client.reconnect() {
        Ok(true) => client
            .upload_chunk(chunk, wrap_at)
            .map(|_| ())
            .map_err(|e| format!("upload retry failed: {e}")),
        Ok(false) => Err(format!("upload server refused to reopen {}", client.filename())),
        Err(e) => Err(format!("reconnect to {} failed: {e}", client.server())),
    }
}

fn close_sink(sink: &mut Sink) {
    match sink {
        Sink::LocalFile { path, file, .. } => {
            if let Err(e) = file.flush() {
                warn!(path = %path.display(), "flush on close failed: {e}");
            }
        }
        Sink::RemoteUpload(client) => client.end(true),
        Sink::Discard | Sink::Failed { .. } => {}
    }
}
