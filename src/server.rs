use crate::directory::Principal;
use crate::ldap_protocol::{
    frame_length, parse_ldap_message, parse_ldap_message_header, BindAuthentication, BindRequest, LdapMessage,
    LdapVersion, ProtocolOp, SearchRequest, LDAP_AUTH_METHOD_NOT_SUPPORTED, LDAP_INVALID_CREDENTIALS, LDAP_OTHER,
    LDAP_PROTOCOL_ERROR, LDAP_SUCCESS, LDAP_TAG_BIND_RESPONSE, LDAP_TAG_SEARCH_RESULT_DONE,
};
use crate::response::ResponseHandler;
use crate::search::{SearchContext, SearchOperation};
use crate::search_manager::{ConnectionId, SearchManager};
use anyhow::{Context, Result};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

const LOCALHOST: &str = "localhost";

/// Listens for LDAP clients and serves BIND, SEARCH, ABANDON and UNBIND.
pub struct GalServer {
    listen_url: String,
    /// Advertised to remote peers; loopback peers always get "localhost".
    host_name: Option<String>,
    max_size_limit: usize,
    context: Arc<SearchContext>,
    searches: Arc<SearchManager>,
    next_connection: AtomicU64,
}

impl GalServer {
    pub fn new(
        listen_url: impl Into<String>,
        host_name: Option<String>,
        max_size_limit: usize,
        context: Arc<SearchContext>,
    ) -> Self {
        Self {
            listen_url: listen_url.into(),
            host_name,
            max_size_limit,
            context,
            searches: Arc::new(SearchManager::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn searches(&self) -> Arc<SearchManager> {
        Arc::clone(&self.searches)
    }

    /// Binds the listen socket without serving it yet.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = parse_listen_url(&self.listen_url)?;
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        info!("LDAP GAL gateway listening on {}", listener.local_addr().unwrap_or(addr));
        Ok(listener)
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accepts clients forever, one task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New connection from {}", peer_addr);
                    self.context.metrics.inc_connections();
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_client(stream, peer_addr).await {
                            error!("Error handling client {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    fn host_name_for(&self, peer_addr: &SocketAddr) -> String {
        if peer_addr.ip().is_loopback() {
            return LOCALHOST.to_string();
        }
        self.host_name.clone().unwrap_or_else(|| LOCALHOST.to_string())
    }

    async fn handle_client(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let (reader, writer) = stream.into_split();
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let responses = Arc::new(ResponseHandler::new(Box::new(writer), self.host_name_for(&peer_addr)));
        let mut connection = Connection {
            id: connection_id,
            peer_addr,
            server: Arc::clone(&self),
            responses,
            user: None,
            login_name: None,
        };
        let result = connection.run(reader).await;
        let cancelled = self.searches.cancel_all(connection_id);
        debug!(
            "Connection {} from {} closed, {} searches cancelled",
            connection_id, peer_addr, cancelled
        );
        result
    }
}

fn parse_listen_url(url: &str) -> Result<SocketAddr> {
    let address = url
        .strip_prefix("ldap://")
        .ok_or_else(|| anyhow::anyhow!("Invalid URL scheme, expected ldap://"))?;
    let address = address.trim_start_matches('/').trim_end_matches('/');

    if let Some(port) = address.strip_prefix(':') {
        let port: u16 = port.parse().context("Invalid port number")?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    } else {
        address
            .parse()
            .with_context(|| format!("Failed to parse address: {}", address))
    }
}

/// What the read loop does after a message.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    server: Arc<GalServer>,
    responses: Arc<ResponseHandler>,
    user: Option<Arc<dyn Principal>>,
    login_name: Option<String>,
}

impl Connection {
    async fn run<R: AsyncRead + Unpin>(&mut self, mut reader: R) -> Result<()> {
        let mut buffer = BytesMut::with_capacity(4096);
        let mut read_buf = vec![0u8; 4096];

        loop {
            let n = reader.read(&mut read_buf).await?;
            if n == 0 {
                debug!("Client {} disconnected", self.peer_addr);
                return Ok(());
            }
            buffer.extend_from_slice(&read_buf[..n]);

            loop {
                let total = match frame_length(&buffer) {
                    Ok(Some(total)) => total,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Invalid LDAP framing from {}: {}", self.peer_addr, e);
                        self.reject(0).await;
                        return Ok(());
                    }
                };
                let frame = buffer.split_to(total);
                match parse_ldap_message(&frame, self.responses.version()) {
                    Ok(message) => {
                        if self.process(message).await? == Flow::Close {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        let message_id = parse_ldap_message_header(&frame)
                            .map(|(id, _)| id)
                            .unwrap_or(0);
                        warn!("Failed to parse LDAP message {} from {}: {:#}", message_id, self.peer_addr, e);
                        self.reject(message_id).await;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Answers an undecodable message with protocolError before the
    /// connection is dropped.
    async fn reject(&self, message_id: i32) {
        self.server.context.metrics.inc_parse_error();
        if let Err(e) = self
            .responses
            .send_client(message_id, LDAP_TAG_BIND_RESPONSE, LDAP_PROTOCOL_ERROR, "Failed to parse LDAP message")
            .await
        {
            debug!("Could not send protocolError to {}: {}", self.peer_addr, e);
        }
    }

    async fn process(&mut self, message: LdapMessage) -> Result<Flow> {
        let message_id = message.message_id;
        debug!("Connection {} message {}: {}", self.id, message_id, op_name(&message.protocol_op));
        self.server.context.metrics.inc_request(op_name(&message.protocol_op));

        match message.protocol_op {
            ProtocolOp::BindRequest(bind) => self.bind(message_id, bind).await?,
            ProtocolOp::SearchRequest(search) => self.search(message_id, search).await,
            ProtocolOp::AbandonRequest(abandoned_id) => {
                if !self.server.searches.abandon(self.id, abandoned_id) {
                    debug!("Abandon of unknown search {} on connection {}", abandoned_id, self.id);
                }
            }
            ProtocolOp::UnbindRequest => {
                debug!("Unbind from {}", self.peer_addr);
                self.user = None;
                self.login_name = None;
                return Ok(Flow::Close);
            }
            ProtocolOp::Unsupported(tag) => {
                warn!("Unsupported operation 0x{:02X} from {}", tag, self.peer_addr);
                self.responses
                    .send_client(message_id, LDAP_TAG_SEARCH_RESULT_DONE, LDAP_OTHER, "Unsupported operation")
                    .await
                    .context("Failed to send unsupported operation response")?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn bind(&mut self, message_id: i32, bind: BindRequest) -> Result<()> {
        self.responses.set_version(LdapVersion::from_wire(bind.version));
        let metrics = &self.server.context.metrics;

        let password = match bind.authentication {
            BindAuthentication::Simple(password) => password,
            BindAuthentication::Sasl { mechanism, .. } => {
                warn!("SASL bind ({}) refused for {}", mechanism, self.peer_addr);
                metrics.inc_error("bind");
                self.responses
                    .send_client(
                        message_id,
                        LDAP_TAG_BIND_RESPONSE,
                        LDAP_AUTH_METHOD_NOT_SUPPORTED,
                        "SASL authentication is not supported",
                    )
                    .await
                    .context("Failed to send bind response")?;
                return Ok(());
            }
        };

        self.user = None;
        self.login_name = None;

        if bind.name.is_empty() || password.is_empty() {
            debug!("Anonymous bind from {}", self.peer_addr);
            self.responses
                .send_bind_response(message_id, LDAP_SUCCESS, None)
                .await
                .context("Failed to send bind response")?;
            return Ok(());
        }

        match self.server.context.directory.authenticate(&bind.name, &password).await {
            Ok(Some(principal)) => {
                info!("Bound {} as {}", self.peer_addr, principal.name());
                self.user = Some(principal);
                self.login_name = Some(bind.name);
                self.responses
                    .send_bind_response(message_id, LDAP_SUCCESS, None)
                    .await
                    .context("Failed to send bind response")?;
            }
            Ok(None) => {
                metrics.inc_error("bind");
                self.responses
                    .send_bind_response(message_id, LDAP_INVALID_CREDENTIALS, None)
                    .await
                    .context("Failed to send bind response")?;
            }
            Err(e) => {
                error!("Authentication of {} failed: {}", bind.name, e);
                metrics.inc_error("bind");
                self.responses
                    .send_err(message_id, LDAP_TAG_BIND_RESPONSE, &e)
                    .await
                    .context("Failed to send bind response")?;
            }
        }
        Ok(())
    }

    async fn search(&self, message_id: i32, request: SearchRequest) {
        let operation = SearchOperation::new(
            message_id,
            request,
            self.server.max_size_limit,
            self.user.clone(),
            self.login_name.clone(),
        );
        debug!(
            "Search {} base='{}' filter={} size_limit={}",
            message_id, operation.base_dn, operation.filter, operation.size_limit
        );
        let registration = self.server.searches.register(self.id, message_id);
        let context = Arc::clone(&self.server.context);
        let responses = Arc::clone(&self.responses);

        if operation.runs_in_background() {
            tokio::spawn(operation.run(context, responses, registration));
        } else {
            operation.run(context, responses, registration).await;
        }
    }
}

fn op_name(op: &ProtocolOp) -> &'static str {
    match op {
        ProtocolOp::BindRequest(_) => "bind",
        ProtocolOp::SearchRequest(_) => "search",
        ProtocolOp::AbandonRequest(_) => "abandon",
        ProtocolOp::UnbindRequest => "unbind",
        ProtocolOp::Unsupported(_) => "unsupported",
    }
}
