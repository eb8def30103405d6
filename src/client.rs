use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use color_eyre::eyre::Context;
use russh::{
    Channel, Disconnect,
    client::{self, Msg, Session},
    keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey, load_secret_key},
};
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    sync::Notify,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{config::ClientParameters, error::TunnelError, keys, protocol};

const MAX_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(5);
const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the tunnel client: connect, negotiate a public port, and serve
/// forwarded connections until the session ends, reconnecting as needed.
/// Connection failures are retried up to five times; handshake rejections
/// are fatal.
pub async fn run(params: ClientParameters) -> color_eyre::Result<()> {
    params.validate()?;
    let identity = if params.identity.is_empty() {
        None
    } else {
        Some(Arc::new(
            load_secret_key(&params.identity, None)
                .with_context(|| format!("Error loading identity {}", params.identity))?,
        ))
    };
    let known_keys = if params.host_key.is_empty() {
        Vec::new()
    } else {
        keys::load_known_host_keys(Path::new(&params.host_key))?
    };

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        info!(
            endpoint = %params.endpoint,
            port = params.port,
            attempt,
            max = MAX_RETRIES,
            "Connecting to tunnel server."
        );
        match run_session(&params, identity.clone(), &known_keys).await {
            Ok(()) => {
                info!(delay = ?RETRY_DELAY, "Session closed. Reconnecting...");
                attempt = 0;
            }
            Err(error) if !error.is_retryable() => return Err(error.into()),
            Err(error) if attempt < MAX_RETRIES => {
                warn!(%error, attempt, "Connection attempt failed.");
            }
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("failed to establish SSH connection after {MAX_RETRIES} attempts")
                });
            }
        }
        sleep(RETRY_DELAY).await;
    }
}

// State shared between the session driver and the channel handler.
struct SessionState {
    local_address: String,
    cancellation_token: CancellationToken,
    bridge_seq: AtomicUsize,
    live_bridges: AtomicUsize,
    drained: Notify,
}

impl SessionState {
    fn begin_bridge(self: &Arc<Self>) -> (usize, BridgeGuard) {
        let id = self.bridge_seq.fetch_add(1, Ordering::AcqRel) + 1;
        self.live_bridges.fetch_add(1, Ordering::AcqRel);
        (
            id,
            BridgeGuard {
                state: Arc::clone(self),
            },
        )
    }

    // Wait for every in-flight bridge to finish. The waiter is registered
    // before the counter is read so a final notify cannot slip between the
    // check and the await.
    async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.live_bridges.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct BridgeGuard {
    state: Arc<SessionState>,
}

impl Drop for BridgeGuard {
    fn drop(&mut self) {
        if self.state.live_bridges.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.drained.notify_waiters();
        }
    }
}

async fn run_session(
    params: &ClientParameters,
    identity: Option<Arc<PrivateKey>>,
    known_keys: &[PublicKey],
) -> Result<(), TunnelError> {
    let config = Arc::new(client::Config::default());
    let state = Arc::new(SessionState {
        local_address: format!("{}:{}", params.local_host, params.local_port),
        cancellation_token: CancellationToken::new(),
        bridge_seq: AtomicUsize::new(0),
        live_bridges: AtomicUsize::new(0),
        drained: Notify::new(),
    });
    let handler = ClientHandler {
        state: Arc::clone(&state),
        host_key_level: params.host_key_level,
        known_keys: known_keys.to_vec(),
    };
    let mut handle =
        client::connect(config, (params.endpoint.as_str(), params.port), handler).await?;
    let authenticated = match identity {
        Some(key) => {
            let hash = handle.best_supported_rsa_hash().await?.flatten();
            handle
                .authenticate_publickey(&params.username, PrivateKeyWithHashAlg::new(key, hash))
                .await?
        }
        None => {
            handle
                .authenticate_password(&params.username, &params.password)
                .await?
        }
    };
    if !authenticated.success() {
        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
        return Err(TunnelError::AuthenticationFailed {
            user: params.username.clone(),
            endpoint: params.endpoint.clone(),
        });
    }
    let channel = handle
        .channel_open_direct_tcpip(
            params.local_host.as_str(),
            params.local_port.into(),
            "127.0.0.1",
            0,
        )
        .await?;
    let mut control = channel.into_stream();
    let assigned =
        match protocol::negotiate_outgoing(&mut control, &params.allowed_ips, params.remote_port)
            .await
        {
            Ok(port) => port,
            Err(error) => {
                state.cancellation_token.cancel();
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "", "English")
                    .await;
                return Err(error);
            }
        };
    info!(
        port = assigned,
        local = %state.local_address,
        "Tunnel established."
    );
    // The control channel stays open for the lifetime of the session; EOF
    // or an error means the server or the connection is gone.
    let mut scratch = [0u8; 64];
    loop {
        match control.read(&mut scratch).await {
            Ok(0) | Err(_) => break,
            Ok(_) => debug!("Ignoring unexpected control data."),
        }
    }
    state.cancellation_token.cancel();
    state.drain().await;
    let _ = handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await;
    Ok(())
}

struct ClientHandler {
    state: Arc<SessionState>,
    host_key_level: u8,
    known_keys: Vec<PublicKey>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);
        match self.host_key_level {
            0 => Ok(true),
            2 if !self.known_keys.is_empty() => {
                if self
                    .known_keys
                    .iter()
                    .any(|key| key.fingerprint(HashAlg::Sha256) == fingerprint)
                {
                    Ok(true)
                } else {
                    error!(%fingerprint, "Server host key does not match any known key.");
                    Ok(false)
                }
            }
            _ => {
                warn!(%fingerprint, "Server host key not verified.");
                Ok(true)
            }
        }
    }

    // The server pushes one channel per connection accepted on the public
    // port; each becomes a bridge to the local service.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.state.cancellation_token.is_cancelled() {
            info!("Rejecting forwarded channel: session closed.");
            tokio::spawn(async move {
                let _ = channel.close().await;
            });
            return Ok(());
        }
        let (id, guard) = self.state.begin_bridge();
        debug!(
            id,
            origin = %originator_address,
            origin_port = originator_port,
            port = connected_port,
            "Incoming forward."
        );
        tokio::spawn(run_bridge(channel, Arc::clone(&self.state), id, guard));
        Ok(())
    }
}

async fn run_bridge(
    channel: Channel<Msg>,
    state: Arc<SessionState>,
    id: usize,
    guard: BridgeGuard,
) {
    let _guard = guard;
    let mut local = match timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(&state.local_address))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            warn!(id, address = %state.local_address, %error, "Error connecting to local service.");
            let _ = channel.close().await;
            return;
        }
        Err(_) => {
            warn!(id, address = %state.local_address, "Timed out connecting to local service.");
            let _ = channel.close().await;
            return;
        }
    };
    let mut stream = channel.into_stream();
    match tokio::io::copy_bidirectional(&mut local, &mut stream).await {
        Ok((to_server, to_local)) => debug!(id, to_server, to_local, "Bridge closed."),
        Err(error) => debug!(id, %error, "Bridge ended with error."),
    }
}
