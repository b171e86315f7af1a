use std::cell::RefCell;
use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use ftp::FtpStream;
use ftp::types::FileType;

use super::listing::parse_listing;
use super::{Endpoint, RemoteEntry, RemoteSession, STREAM_BUF_SIZE, copy_stream};
use crate::config::FetchConfig;
use crate::error::FetchError;

/// Connection settings for an FTP server.
#[derive(Clone, Debug)]
pub struct FtpEndpoint {
    host: String,
    port: u16,
    username: String,
    password: String,
    io_timeout: Duration,
}

impl FtpEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: "anonymous".to_string(),
            password: "anonymous@".to_string(),
            io_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(cfg: &FetchConfig) -> Self {
        Self {
            host: cfg.endpoint_host.clone(),
            port: cfg.endpoint_port,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            io_timeout: Duration::from_secs(cfg.io_timeout_secs),
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    /// Bounds the TCP connect as well as every control/data read and write.
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// First resolved address that accepts a TCP connection within
    /// `io_timeout`. The `ftp` client connects without a deadline, so an
    /// unresponsive host is ruled out here first.
    fn reachable_addr(&self) -> Result<SocketAddr, FetchError> {
        let addr = self.addr();
        let candidates: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(|e| FetchError::connection(&format!("cannot resolve {}", addr), e))?
            .collect();
        let mut last_err = None;
        for sock in candidates {
            match TcpStream::connect_timeout(&sock, self.io_timeout) {
                Ok(_) => return Ok(sock),
                Err(e) => {
                    tracing::debug!("[ftp] {} not reachable: {}", sock, e);
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => FetchError::connection(&format!("cannot connect to {}", addr), e),
            None => FetchError::Connection(format!("no address for {}", addr)),
        })
    }
}

impl Endpoint for FtpEndpoint {
    fn describe(&self) -> String {
        format!("ftp://{}", self.addr())
    }

    fn open(&self) -> Result<Box<dyn RemoteSession>, FetchError> {
        let addr = self.addr();
        let sock = self.reachable_addr()?;
        let mut stream = FtpStream::connect(sock)?;
        // best-effort: a missing timeout only risks a slower failure
        let _ = stream.get_ref().set_read_timeout(Some(self.io_timeout));
        let _ = stream.get_ref().set_write_timeout(Some(self.io_timeout));
        stream.login(&self.username, &self.password)?;
        stream.transfer_type(FileType::Binary)?;
        tracing::debug!("[ftp] logged in to {} as {}", addr, self.username);
        Ok(Box::new(FtpSession { stream, addr }))
    }
}

struct FtpSession {
    stream: FtpStream,
    addr: String,
}

impl RemoteSession for FtpSession {
    fn list(&mut self, directory: &str) -> Result<Vec<RemoteEntry>, FetchError> {
        let lines = self.stream.list(Some(directory))?;
        parse_listing(directory, lines.as_slice())
    }

    fn retrieve(&mut self, path: &str, sink: &mut dyn Write) -> Result<u64, FetchError> {
        // `retr` only accepts an `Fn` callback, so the sink and the precise
        // failure travel through cells.
        let sink = RefCell::new(sink);
        let failure: RefCell<Option<FetchError>> = RefCell::new(None);
        let res = self.stream.retr(path, |reader| {
            let mut guard = sink.borrow_mut();
            copy_stream(reader, &mut **guard, STREAM_BUF_SIZE).map_err(|e| {
                let msg = e.to_string();
                *failure.borrow_mut() = Some(e);
                ftp::FtpError::InvalidResponse(msg)
            })
        });
        match res {
            Ok(n) => Ok(n),
            Err(e) => Err(failure.into_inner().unwrap_or_else(|| FetchError::from(e))),
        }
    }

    fn close(mut self: Box<Self>) -> Result<(), FetchError> {
        tracing::debug!("[ftp] closing connection to {}", self.addr);
        self.stream.quit().map_err(FetchError::from)
    }
}
