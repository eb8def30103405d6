use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use color_eyre::eyre::Context;
use russh::{
    Channel, MethodKind, MethodSet,
    keys::{HashAlg, PublicKey},
    server::{Auth, Config, Handler, Msg, Session},
};
use tokio::{
    net::{TcpListener, TcpStream},
    pin,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    allocator::PortAllocator,
    config::ServerParameters,
    forwarding::ForwardSession,
    ip::AddressMatcher,
    keys,
};

pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// Accept errors tied to a single failed connection; everything else is
// fatal to the loop that saw it.
pub(crate) fn is_transient_accept_error(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        error.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

/// State shared by every SSH connection: the port ledger, admission list,
/// and credentials.
pub(crate) struct TunnelServer {
    pub(crate) bind_address: String,
    pub(crate) allocator: Arc<PortAllocator>,
    pub(crate) admission: AddressMatcher,
    username: String,
    password: Option<String>,
    authorized_keys: Vec<PublicKey>,
    session_id: AtomicUsize,
}

/// Run the tunnel server until the listener fails or the process is
/// terminated.
pub async fn run(params: ServerParameters) -> color_eyre::Result<()> {
    params.validate()?;
    let mut host_keys = Vec::new();
    for (path, algorithm) in params.host_key_paths() {
        host_keys.push(keys::load_or_generate_host_key(Path::new(path), algorithm)?);
    }
    let authorized_keys = if params.authorized_keys.is_empty() {
        Vec::new()
    } else {
        keys::load_authorized_keys(Path::new(&params.authorized_keys))?
    };
    let config = Arc::new(Config {
        inactivity_timeout: Some(Duration::from_secs(3600)),
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: host_keys,
        ..Default::default()
    });
    let server = Arc::new(TunnelServer {
        bind_address: params.bind.clone(),
        allocator: Arc::new(PortAllocator::new(
            params.port_range_start,
            params.port_range_end,
        )),
        admission: AddressMatcher::new(&params.allowed_ips),
        username: params.username,
        password: (!params.password.is_empty()).then_some(params.password),
        authorized_keys,
        session_id: AtomicUsize::new(0),
    });
    let listener = TcpListener::bind((params.bind.as_str(), params.port))
        .await
        .with_context(|| format!("Error listening on {}:{}", params.bind, params.port))?;
    info!(address = %params.bind, port = params.port, "Listening for SSH connections.");
    let signal_handler = wait_for_signal();
    pin!(signal_handler);
    loop {
        tokio::select! {
            conn = listener.accept() => match conn {
                Ok((stream, address)) => {
                    if let Err(error) = stream.set_nodelay(true) {
                        warn!(%error, %address, "Error setting nodelay.");
                    }
                    handle_ssh_connection(stream, address, Arc::clone(&config), &server);
                }
                Err(error) if is_transient_accept_error(&error) => {
                    warn!(%error, "Transient accept error.");
                    sleep(ACCEPT_BACKOFF).await;
                }
                Err(error) => {
                    return Err(error).with_context(|| "Error accepting SSH connection");
                }
            },
            _ = &mut signal_handler => break,
        }
    }
    info!("Tunnel server is shutting down.");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut signal_terminate = signal(SignalKind::terminate()).unwrap();
    let mut signal_interrupt = signal(SignalKind::interrupt()).unwrap();

    tokio::select! {
        _ = signal_terminate.recv() => debug!("Received SIGTERM."),
        _ = signal_interrupt.recv() => debug!("Received SIGINT."),
    };
}

#[cfg(windows)]
async fn wait_for_signal() {
    use tokio::signal::windows;

    let mut signal_c = windows::ctrl_c().unwrap();
    let mut signal_break = windows::ctrl_break().unwrap();
    let mut signal_close = windows::ctrl_close().unwrap();
    let mut signal_shutdown = windows::ctrl_shutdown().unwrap();

    tokio::select! {
        _ = signal_c.recv() => debug!("Received CTRL_C."),
        _ = signal_break.recv() => debug!("Received CTRL_BREAK."),
        _ = signal_close.recv() => debug!("Received CTRL_CLOSE."),
        _ = signal_shutdown.recv() => debug!("Received CTRL_SHUTDOWN."),
    };
}

fn handle_ssh_connection(
    stream: TcpStream,
    address: SocketAddr,
    config: Arc<Config>,
    server: &Arc<TunnelServer>,
) {
    let cancellation_token = CancellationToken::new();
    let handler = ServerHandler {
        id: server.session_id.fetch_add(1, Ordering::AcqRel),
        peer: address,
        server: Arc::clone(server),
        cancellation_token: cancellation_token.clone(),
    };
    info!(peer = %address, "SSH client connected.");
    tokio::spawn(async move {
        match russh::server::run_stream(config, stream, handler).await {
            Ok(session) => {
                if let Err(error) = session.await {
                    warn!(%error, %address, "Connection closed.");
                }
            }
            Err(error) => {
                warn!(%error, %address, "Connection setup failed.");
            }
        }
        // The connection is gone; unwind any forward sessions serving it.
        cancellation_token.cancel();
        info!(peer = %address, "SSH client disconnected.");
    });
}

// Per-connection SSH handler.
pub(crate) struct ServerHandler {
    id: usize,
    peer: SocketAddr,
    server: Arc<TunnelServer>,
    cancellation_token: CancellationToken,
}

impl ServerHandler {
    fn remaining_methods(&self) -> MethodSet {
        let mut methods = Vec::new();
        if self.server.password.is_some() {
            methods.push(MethodKind::Password);
        }
        if !self.server.authorized_keys.is_empty() {
            methods.push(MethodKind::PublicKey);
        }
        MethodSet::from(methods.as_slice())
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(self.remaining_methods()),
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if let Some(expected) = self.server.password.as_deref()
            && user == self.server.username
            && password == expected
        {
            info!(peer = %self.peer, %user, "SSH client authenticated with password.");
            return Ok(Auth::Accept);
        }
        warn!(peer = %self.peer, %user, "Failed password authentication.");
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(HashAlg::Sha256);
        if user == self.server.username
            && self
                .server
                .authorized_keys
                .iter()
                .any(|key| key.fingerprint(HashAlg::Sha256) == fingerprint)
        {
            info!(
                peer = %self.peer, %user, %fingerprint,
                "SSH client authenticated with public key."
            );
            return Ok(Auth::Accept);
        }
        warn!(peer = %self.peer, %user, %fingerprint, "Failed public key authentication.");
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    // Every client-opened channel carries one tunnel negotiation, followed
    // by the forward session it establishes.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let forward = ForwardSession::new(
            Arc::clone(&self.server),
            session.handle(),
            self.peer,
            self.cancellation_token.clone(),
            self.id,
        );
        tokio::spawn(forward.run(channel.into_stream()));
        Ok(true)
    }
}
