//! Client for the media server's upload service
//!
//! One TCP connection carries CRLF-terminated commands. `WRITEOPEN` and
//! `SWITCH` are acknowledged with `OK`; `WRITE <offset> <length>` is
//! followed by the raw bytes and gets no reply.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::config::UploadConfig;
use crate::error::UploadError;

pub struct UploadClient {
    server: String,
    addr: SocketAddr,
    connect_timeout: Duration,
    io_timeout: Duration,
    conn: Option<Connection>,
    filename: String,
    upload_id: u32,
    offset: u64,
}

struct Connection {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl UploadClient {
    /// Resolve `server` (`host` or `host:port`) and open the control
    /// connection.
    pub fn connect(server: &str, config: &UploadConfig) -> Result<Self, UploadError> {
        let addr = resolve(server, config.port)?;
        let mut client = Self {
            server: server.to_string(),
            addr,
            connect_timeout: config.connect_timeout(),
            io_timeout: config.io_timeout(),
            conn: None,
            filename: String::new(),
            upload_id: 0,
            offset: 0,
        };
        client.open_connection()?;
        Ok(client)
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Address the control connection goes to
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn upload_id(&self) -> u32 {
        self.upload_id
    }

    /// Remote offset of the next chunk
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Open `filename` for writing. `false` means the server refused it.
    pub fn start(&mut self, filename: &str, upload_id: u32) -> Result<bool, UploadError> {
        let reply = self.request("WRITEOPEN", &format!("WRITEOPEN {filename} {upload_id}"))?;
        if reply != "OK" {
            warn!(server = %self.server, filename, reply = %reply, "upload start refused");
            return Ok(false);
        }
        info!(server = %self.server, filename, upload_id, "upload started");
        self.filename = filename.to_string();
        self.upload_id = upload_id;
        self.offset = 0;
        Ok(true)
    }

    /// Send one chunk at the current offset. With `wrap_at`, the offset
    /// returns to zero once it has reached that size. The offset is only
    /// advanced when the chunk went out.
    pub fn upload_chunk(&mut self, chunk: &[u8], wrap_at: Option<u64>) -> Result<usize, UploadError> {
        if chunk.is_empty() {
            return Ok(0);
        }
        let offset = match wrap_at {
            Some(limit) if limit > 0 && self.offset >= limit => 0,
            _ => self.offset,
        };
        let conn = self.conn.as_mut().ok_or(UploadError::NotConnected)?;
        let mut frame = format!("WRITE {offset} {}\r\n", chunk.len()).into_bytes();
        frame.extend_from_slice(chunk);
        if let Err(e) = conn.writer.write_all(&frame) {
            self.conn = None;
            return Err(e.into());
        }
        trace!(offset, len = chunk.len(), "chunk uploaded");
        self.offset = offset + chunk.len() as u64;
        Ok(chunk.len())
    }

    /// Continue in `filename` on the same connection. `false` means the
    /// server refused and the current file stays open.
    pub fn switch_to(&mut self, filename: &str, upload_id: u32) -> Result<bool, UploadError> {
        let reply = self.request("SWITCH", &format!("SWITCH {filename} {upload_id}"))?;
        if reply != "OK" {
            warn!(server = %self.server, filename, reply = %reply, "upload switch refused");
            return Ok(false);
        }
        info!(server = %self.server, from = %self.filename, to = filename, "upload switched");
        self.filename = filename.to_string();
        self.upload_id = upload_id;
        self.offset = 0;
        Ok(true)
    }

    /// Drop the connection and open the current file again. The offset is
    /// kept so a failed chunk can be rewritten in place.
    pub fn reconnect(&mut self) -> Result<bool, UploadError> {
        self.conn = None;
        self.open_connection()?;
        let (filename, upload_id, offset) = (self.filename.clone(), self.upload_id, self.offset);
        let accepted = self.start(&filename, upload_id)?;
        self.offset = offset;
        Ok(accepted)
    }

    /// Close the file and the connection. Best effort.
    pub fn end(&mut self, flush: bool) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if flush {
            let _ = conn.writer.flush();
        }
        if let Err(e) = conn.writer.write_all(b"CLOSE\r\n") {
            debug!(server = %self.server, "CLOSE not sent: {e}");
            return;
        }
        let mut reply = String::new();
        let _ = conn.reader.read_line(&mut reply);
        let _ = conn.writer.write_all(b"QUIT\r\n");
        debug!(server = %self.server, filename = %self.filename, "upload ended");
    }

    fn open_connection(&mut self) -> Result<(), UploadError> {
        let writer = TcpStream::connect_timeout(&self.addr, self.connect_timeout)?;
        writer.set_read_timeout(Some(self.io_timeout))?;
        writer.set_write_timeout(Some(self.io_timeout))?;
        writer.set_nodelay(true)?;
        let reader = BufReader::new(writer.try_clone()?);
        self.conn = Some(Connection { writer, reader });
        Ok(())
    }

    fn request(&mut self, command: &'static str, line: &str) -> Result<String, UploadError> {
        let conn = self.conn.as_mut().ok_or(UploadError::NotConnected)?;
        let result = exchange(conn, line);
        if result.is_err() {
            self.conn = None;
        }
        let reply = result?;
        trace!(command, reply = %reply, "upload reply");
        Ok(reply)
    }
}

impl Drop for UploadClient {
    fn drop(&mut self) {
        self.end(false);
    }
}

fn exchange(conn: &mut Connection, line: &str) -> Result<String, UploadError> {
    conn.writer.write_all(format!("{line}\r\n").as_bytes())?;
    let mut reply = String::new();
    if conn.reader.read_line(&mut reply)? == 0 {
        return Err(std::io::Error::new(ErrorKind::UnexpectedEof, "upload server closed the connection").into());
    }
    Ok(reply.trim_end().to_string())
}

/// `host` or `host:port` to the first address it resolves to.
pub(crate) fn resolve(server: &str, default_port: u16) -> Result<SocketAddr, UploadError> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let addrs = if server.contains(':') {
        server.to_socket_addrs()
    } else {
        (server, default_port).to_socket_addrs()
    };
    addrs?.next().ok_or_else(|| {
        UploadError::Io(std::io::Error::new(
            ErrorKind::NotFound,
            format!("{server} did not resolve"),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    /// Accepts one connection and answers WRITEOPEN/SWITCH with the given
    /// replies in order. Returns everything the client sent.
    fn server(replies: Vec<&'static str>) -> (String, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut writer = stream;
            let mut seen = Vec::new();
            let mut replies = replies.into_iter();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    break;
                }
                seen.extend_from_slice(line.as_bytes());
                let words: Vec<&str> = line.split_whitespace().collect();
                match words.first().copied() {
                    Some("WRITEOPEN") | Some("SWITCH") => {
                        let reply = replies.next().unwrap_or("OK");
                        writer.write_all(format!("{reply}\r\n").as_bytes()).expect("reply");
                    }
                    Some("WRITE") => {
                        let len: usize = words[2].parse().expect("len");
                        let mut body = vec![0u8; len];
                        reader.read_exact(&mut body).expect("body");
                        seen.extend_from_slice(&body);
                    }
                    Some("CLOSE") => writer.write_all(b"OK\r\n").expect("reply"),
                    _ => break,
                }
            }
            seen
        });
        (addr, handle)
    }

    fn config() -> UploadConfig {
        UploadConfig {
            connect_timeout_ms: 1_000,
            io_timeout_ms: 2_000,
            ..UploadConfig::default()
        }
    }

    #[test]
    fn start_write_switch_end() {
        let (addr, handle) = server(vec!["OK", "OK"]);
        let mut client = UploadClient::connect(&addr, &config()).expect("connect");
        assert!(client.start("a.ts", 7).expect("start"));
        assert_eq!(client.upload_chunk(b"abc", None).expect("chunk"), 3);
        assert_eq!(client.offset(), 3);
        assert!(client.switch_to("b.ts", 8).expect("switch"));
        assert_eq!(client.offset(), 0);
        client.upload_chunk(b"de", None).expect("chunk");
        client.end(true);

        let sent = String::from_utf8(handle.join().expect("server")).expect("ascii");
        assert_eq!(
            sent,
            "WRITEOPEN a.ts 7\r\nWRITE 0 3\r\nabcSWITCH b.ts 8\r\nWRITE 0 2\r\ndeCLOSE\r\nQUIT\r\n"
        );
    }

    #[test]
    fn refusals_are_not_errors() {
        let (addr, handle) = server(vec!["NO", "OK", "BUSY"]);
        let mut client = UploadClient::connect(&addr, &config()).expect("connect");
        assert!(!client.start("a.ts", 1).expect("start"));
        assert!(client.start("a.ts", 1).expect("start"));
        assert!(!client.switch_to("b.ts", 2).expect("switch"));
        assert_eq!(client.filename(), "a.ts");
        drop(client);
        handle.join().expect("server");
    }

    #[test]
    fn offset_wraps_at_limit() {
        let (addr, handle) = server(vec!["OK"]);
        let mut client = UploadClient::connect(&addr, &config()).expect("connect");
        client.start("ring.ts", 3).expect("start");
        client.upload_chunk(&[1; 4], Some(8)).expect("chunk");
        client.upload_chunk(&[2; 4], Some(8)).expect("chunk");
        assert_eq!(client.offset(), 8);
        client.upload_chunk(&[3; 4], Some(8)).expect("chunk");
        assert_eq!(client.offset(), 4);
        client.end(false);

        let sent = handle.join().expect("server");
        let text = String::from_utf8_lossy(&sent);
        assert!(text.contains("WRITE 4 4\r\n"));
        assert!(text.matches("WRITE 0 4\r\n").count() == 2);
    }

    #[test]
    fn writes_need_a_connection() {
        let (addr, handle) = server(vec![]);
        let mut client = UploadClient::connect(&addr, &config()).expect("connect");
        client.end(false);
        assert!(matches!(client.upload_chunk(b"x", None), Err(UploadError::NotConnected)));
        handle.join().expect("server");
    }
}
