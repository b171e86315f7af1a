// remote module: endpoint abstraction, listing and concrete endpoints
pub mod ftp_endpoint;
pub mod listing;
pub mod memory;

use std::io::{Read, Write};

use crate::error::FetchError;

pub use listing::RemoteListing;

/// Chunk size used when streaming remote bytes to a local sink.
pub const STREAM_BUF_SIZE: usize = 64 * 1024;

/// One entry reported by a directory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Absolute remote path (`/home/anonymous/hello.txt`).
    pub path: String,
    pub is_directory: bool,
    /// Size as reported by the listing, when the format carries one.
    pub size: Option<u64>,
}

impl RemoteEntry {
    pub fn file(path: impl Into<String>, size: Option<u64>) -> Self {
        Self { path: path.into(), is_directory: false, size }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self { path: path.into(), is_directory: true, size: None }
    }
}

/// Something that can hand out control connections to a remote server.
///
/// Implementors must be shareable across worker threads; each call to
/// [`Endpoint::open`] yields a session owned by exactly one caller.
pub trait Endpoint: Send + Sync {
    /// Human-readable address, used in logs and summaries.
    fn describe(&self) -> String;
    fn open(&self) -> Result<Box<dyn RemoteSession>, FetchError>;
}

/// A single, exclusively owned control connection.
pub trait RemoteSession: Send {
    /// List the immediate children of `directory` in server order.
    fn list(&mut self, directory: &str) -> Result<Vec<RemoteEntry>, FetchError>;
    /// Stream the remote file at `path` into `sink`, returning the byte count.
    /// Read failures map to `Connection`, sink failures map to `Io`.
    fn retrieve(&mut self, path: &str, sink: &mut dyn Write) -> Result<u64, FetchError>;
    /// Politely close the connection.
    fn close(self: Box<Self>) -> Result<(), FetchError>;
}

/// Copy `reader` into `sink` chunk by chunk, attributing failures to the side
/// that produced them.
pub fn copy_stream(
    reader: &mut dyn Read,
    sink: &mut dyn Write,
    buf_size: usize,
) -> Result<u64, FetchError> {
    let mut buf = vec![0u8; buf_size.max(1)];
    let mut total: u64 = 0;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FetchError::connection("remote read failed", e)),
        };
        sink.write_all(&buf[..n]).map_err(|e| FetchError::io("local write failed", e))?;
        total += n as u64;
    }
    sink.flush().map_err(|e| FetchError::io("local flush failed", e))?;
    Ok(total)
}

/// Join a directory and a child name with exactly one `/`.
pub fn join_remote(dir: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if dir.is_empty() || dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}
