//! Shared test infrastructure: an in-process mock NNTP server and NZB
//! fixture builders.

// Each integration test binary compiles this module independently and uses
// a different subset of it.
#![allow(dead_code)]

use nzb_connect::config::ServerConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Scripted response for one message-id
#[derive(Clone)]
pub enum Article {
    /// 222 followed by this dot-terminated body
    Body(Vec<u8>),
    /// A bare rejection code (e.g. 430)
    Code(u16),
}

struct ServerState {
    articles: Mutex<HashMap<String, Article>>,
    credentials: Option<(String, String)>,
    connections_opened: AtomicUsize,
    bodies_served: AtomicUsize,
    delay: Mutex<Duration>,
}

/// A minimal NNTP server good enough to drive the download pipeline:
/// greeting, AUTHINFO, BODY with dot-stuffing, QUIT.
pub struct MockNntpServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl MockNntpServer {
    /// Bind on an ephemeral port and start accepting
    pub async fn start() -> Self {
        Self::start_with_credentials(None).await
    }

    /// Like [`Self::start`], requiring the given AUTHINFO credentials
    pub async fn start_with_credentials(credentials: Option<(String, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(ServerState {
            articles: Mutex::new(HashMap::new()),
            credentials,
            connections_opened: AtomicUsize::new(0),
            bodies_served: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(socket, state).await;
                });
            }
        });

        Self { addr, state }
    }

    /// Register a raw article body for a bare message-id
    pub fn add_article(&self, message_id: &str, body: Vec<u8>) {
        self.state
            .articles
            .lock()
            .expect("articles lock")
            .insert(message_id.to_string(), Article::Body(body));
    }

    /// Register a yEnc-encoded single-part article carrying `payload`
    pub fn add_yenc_article(&self, message_id: &str, payload: &[u8], name: &str) {
        self.add_article(
            message_id,
            nzb_connect::yenc::encode(payload, name, 128, None),
        );
    }

    /// Make a message-id answer with a rejection code
    pub fn fail_article(&self, message_id: &str, code: u16) {
        self.state
            .articles
            .lock()
            .expect("articles lock")
            .insert(message_id.to_string(), Article::Code(code));
    }

    /// Delay every BODY response (for cancellation tests)
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().expect("delay lock") = delay;
    }

    /// Total connections accepted so far
    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    /// Total successful BODY responses served
    pub fn bodies_served(&self) -> usize {
        self.state.bodies_served.load(Ordering::SeqCst)
    }

    /// The bound port
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// A server config pointing at this mock
    pub fn server_config(&self, name: &str, connections: usize) -> ServerConfig {
        ServerConfig {
            id: name.to_string(),
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: self.port(),
            tls: false,
            username: self
                .state
                .credentials
                .as_ref()
                .map(|(user, _)| user.clone()),
            password: self
                .state
                .credentials
                .as_ref()
                .map(|(_, pass)| pass.clone()),
            connections,
            enabled: true,
        }
    }
}

async fn serve_connection(socket: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    state.connections_opened.fetch_add(1, Ordering::SeqCst);
    let mut reader = BufReader::new(socket);
    reader.get_mut().write_all(b"200 mock news ready\r\n").await?;

    let mut pending_user: Option<String> = None;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end();

        if let Some(user) = command.strip_prefix("AUTHINFO USER ") {
            match &state.credentials {
                None => reader.get_mut().write_all(b"281 ok\r\n").await?,
                Some(_) => {
                    pending_user = Some(user.to_string());
                    reader
                        .get_mut()
                        .write_all(b"381 password required\r\n")
                        .await?;
                }
            }
        } else if let Some(pass) = command.strip_prefix("AUTHINFO PASS ") {
            let ok = state
                .credentials
                .as_ref()
                .map(|(user, password)| {
                    pending_user.as_deref() == Some(user.as_str()) && pass == password
                })
                .unwrap_or(true);
            if ok {
                reader.get_mut().write_all(b"281 ok\r\n").await?;
            } else {
                reader
                    .get_mut()
                    .write_all(b"481 invalid credentials\r\n")
                    .await?;
            }
        } else if let Some(id) = command.strip_prefix("BODY ") {
            let delay = *state.delay.lock().expect("delay lock");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let id = id.trim().trim_start_matches('<').trim_end_matches('>');
            let article = state
                .articles
                .lock()
                .expect("articles lock")
                .get(id)
                .cloned();
            match article {
                Some(Article::Body(body)) => {
                    let response = format!("222 0 <{id}>\r\n");
                    reader.get_mut().write_all(response.as_bytes()).await?;
                    reader.get_mut().write_all(&dot_stuff(&body)).await?;
                    reader.get_mut().write_all(b".\r\n").await?;
                    state.bodies_served.fetch_add(1, Ordering::SeqCst);
                }
                Some(Article::Code(code)) => {
                    let response = format!("{code} unavailable\r\n");
                    reader.get_mut().write_all(response.as_bytes()).await?;
                }
                None => {
                    reader
                        .get_mut()
                        .write_all(b"430 no such article\r\n")
                        .await?;
                }
            }
        } else if command == "QUIT" {
            reader.get_mut().write_all(b"205 bye\r\n").await?;
            return Ok(());
        } else {
            reader
                .get_mut()
                .write_all(b"500 command not recognized\r\n")
                .await?;
        }
    }
}

/// NNTP transport dot-stuffing: body lines starting with `.` gain one dot
fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    for line in body.split_inclusive(|&b| b == b'\n') {
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
    }
    // The pipeline always terminates lines; keep a bare trailing fragment
    // line-terminated so the terminator sequence stays unambiguous.
    if !out.ends_with(b"\n") && !out.is_empty() {
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Build an NZB document from (subject, [(number, bytes, message-id)])
/// file tuples.
pub fn nzb_document(files: &[(&str, Vec<(u32, u64, &str)>)]) -> Vec<u8> {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<nzb>\n");
    for (subject, segments) in files {
        xml.push_str(&format!(
            "  <file poster=\"tester@example.com\" date=\"1700000000\" subject=\"{}\">\n",
            subject.replace('"', "&quot;")
        ));
        xml.push_str("    <groups><group>alt.binaries.test</group></groups>\n    <segments>\n");
        for (number, bytes, message_id) in segments {
            xml.push_str(&format!(
                "      <segment bytes=\"{bytes}\" number=\"{number}\">{message_id}</segment>\n"
            ));
        }
        xml.push_str("    </segments>\n  </file>\n");
    }
    xml.push_str("</nzb>\n");
    xml.into_bytes()
}
