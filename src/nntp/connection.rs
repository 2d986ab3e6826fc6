//! A single authenticated NNTP session
//!
//! Protocol subset used by the download pipeline: greeting (200/201),
//! `AUTHINFO USER`/`AUTHINFO PASS` (281/381), `BODY <message-id>` (222)
//! with dot-terminated multiline bodies, and `QUIT`.
//!
//! Framing: single-line responses are CRLF-terminated with a 3-digit code;
//! multiline bodies end at a line containing only `.`, and body lines
//! beginning with a dot have exactly one leading dot stripped.
//!
//! Deadlines: every write is bounded by 30 s, every read by 60 s since the
//! last byte. These are absolute per-operation timeouts; they do not honor
//! caller cancellation (torn-down pools close the sockets instead).

use crate::config::ServerConfig;
use crate::error::NntpError;
use crate::nntp::dialer::{self, NntpStream};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const QUIT_TIMEOUT: Duration = Duration::from_secs(5);

/// One NNTP session; exclusively owned while leased from a pool
#[derive(Debug)]
pub struct NntpConnection {
    stream: BufReader<NntpStream>,
    server: String,
}

impl NntpConnection {
    /// Dial, read the greeting, and authenticate when credentials are set.
    ///
    /// A non-empty `interface` pins the socket to that device before
    /// connecting.
    pub async fn connect(server: &ServerConfig, interface: &str) -> Result<Self, NntpError> {
        let stream = dialer::dial(&server.host, server.port, server.tls, interface).await?;
        let mut conn = Self {
            stream: BufReader::new(stream),
            server: server.name.clone(),
        };

        let (code, _) = conn.read_response().await?;
        if code != 200 && code != 201 {
            conn.shutdown().await;
            return Err(NntpError::Greeting(code));
        }

        if let Some(username) = &server.username {
            let password = server.password.as_deref().unwrap_or("");
            if let Err(e) = conn.authenticate(username, password).await {
                conn.shutdown().await;
                return Err(e);
            }
        }

        debug!(server = %server.name, "NNTP session ready");
        Ok(conn)
    }

    /// Fetch the body of an article by message-id.
    ///
    /// The id is wrapped in angle brackets if not already. Any response
    /// other than 222 is [`NntpError::ArticleUnavailable`].
    pub async fn fetch_body(&mut self, message_id: &str) -> Result<Vec<u8>, NntpError> {
        let id = if message_id.starts_with('<') {
            message_id.to_string()
        } else {
            format!("<{message_id}>")
        };

        self.send_command(&format!("BODY {id}")).await?;
        let (code, _) = self.read_response().await?;
        if code != 222 {
            trace!(server = %self.server, %id, code, "BODY refused");
            return Err(NntpError::ArticleUnavailable { code });
        }
        self.read_multiline().await
    }

    /// Best-effort `QUIT`, then close the socket
    pub async fn close(mut self) {
        let _ = tokio::time::timeout(QUIT_TIMEOUT, async {
            let _ = self.stream.get_mut().write_all(b"QUIT\r\n").await;
            let _ = self.stream.get_mut().flush().await;
        })
        .await;
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        let _ = self.stream.get_mut().shutdown().await;
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> Result<(), NntpError> {
        self.send_command(&format!("AUTHINFO USER {username}"))
            .await?;
        let (code, _) = self.read_response().await?;
        match code {
            281 => return Ok(()), // no password required
            381 => {}
            other => return Err(NntpError::AuthFailed(other)),
        }

        self.send_command(&format!("AUTHINFO PASS {password}"))
            .await?;
        let (code, _) = self.read_response().await?;
        if code != 281 {
            return Err(NntpError::AuthFailed(code));
        }
        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> Result<(), NntpError> {
        let line = format!("{command}\r\n");
        tokio::time::timeout(WRITE_TIMEOUT, async {
            self.stream.get_mut().write_all(line.as_bytes()).await?;
            self.stream.get_mut().flush().await
        })
        .await
        .map_err(|_| NntpError::Timeout("write"))?
        .map_err(NntpError::Transport)
    }

    /// Read one raw line including its terminator
    async fn read_line_raw(&mut self) -> Result<Vec<u8>, NntpError> {
        let mut line = Vec::new();
        let n = tokio::time::timeout(READ_TIMEOUT, self.stream.read_until(b'\n', &mut line))
            .await
            .map_err(|_| NntpError::Timeout("read"))?
            .map_err(NntpError::Transport)?;
        if n == 0 {
            return Err(NntpError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }
        Ok(line)
    }

    /// Read a single-line response: 3-digit code, then the message from
    /// byte 4 onward.
    async fn read_response(&mut self) -> Result<(u16, String), NntpError> {
        let line = self.read_line_raw().await?;
        let trimmed = trim_crlf(&line);
        if trimmed.len() < 3 {
            return Err(NntpError::Protocol(format!(
                "short response: {:?}",
                String::from_utf8_lossy(trimmed)
            )));
        }
        let code = std::str::from_utf8(&trimmed[..3])
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| {
                NntpError::Protocol(format!(
                    "invalid response code: {:?}",
                    String::from_utf8_lossy(&trimmed[..3])
                ))
            })?;
        let message = if trimmed.len() > 4 {
            String::from_utf8_lossy(&trimmed[4..]).into_owned()
        } else {
            String::new()
        };
        Ok((code, message))
    }

    /// Read a dot-terminated multiline body, applying canonical
    /// dot-unstuffing: strip exactly one leading dot on body lines that
    /// begin with a dot.
    async fn read_multiline(&mut self) -> Result<Vec<u8>, NntpError> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line_raw().await?;
            let trimmed = trim_crlf(&line);
            if trimmed == b"." {
                break;
            }
            if trimmed.first() == Some(&b'.') {
                body.extend_from_slice(&line[1..]);
            } else {
                body.extend_from_slice(&line);
            }
        }
        Ok(body)
    }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}
