use std::{net::SocketAddr, sync::Arc};

use russh::{
    ChannelStream,
    server::{Handle, Msg},
};
use tokio::{
    io::copy_bidirectional,
    net::{TcpListener, TcpStream},
    task::JoinSet,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    ip::AddressMatcher,
    protocol::{self, ControlCode, PortDecision},
    server::{ACCEPT_BACKOFF, TunnelServer, is_transient_accept_error},
};

/// Server-side owner of one public port: negotiates the tunnel over the
/// control channel, binds the port, and bridges every accepted connection
/// back to the client over a fresh channel.
pub(crate) struct ForwardSession {
    server: Arc<TunnelServer>,
    handle: Handle,
    peer: SocketAddr,
    cancellation_token: CancellationToken,
    session: usize,
}

impl ForwardSession {
    pub(crate) fn new(
        server: Arc<TunnelServer>,
        handle: Handle,
        peer: SocketAddr,
        cancellation_token: CancellationToken,
        session: usize,
    ) -> Self {
        ForwardSession {
            server,
            handle,
            peer,
            cancellation_token,
            session,
        }
    }

    pub(crate) async fn run(self, mut stream: ChannelStream<Msg>) {
        let peer_ip = self.peer.ip().to_canonical().to_string();
        let admitted = self.server.admission.admits(&peer_ip);
        let request = match protocol::negotiate_incoming(&mut stream, admitted).await {
            Ok(request) => request,
            Err(error) => {
                warn!(session = self.session, peer = %self.peer, %error, "Handshake failed.");
                return;
            }
        };
        debug!(
            session = self.session,
            whitelist = ?request.whitelist,
            port = request.requested_port,
            "Tunnel requested."
        );
        let reservation = match self.server.allocator.reserve(request.requested_port) {
            Ok(reservation) => reservation,
            Err(error) => {
                warn!(
                    session = self.session, peer = %self.peer,
                    port = request.requested_port, %error,
                    "Port assignment failed."
                );
                let _ =
                    protocol::write_decision(&mut stream, PortDecision::Rejected(error.code()))
                        .await;
                return;
            }
        };
        let port = reservation.port();
        let listener = match TcpListener::bind((self.server.bind_address.as_str(), port)).await {
            Ok(listener) => listener,
            Err(error) => {
                warn!(session = self.session, port, %error, "Error binding public port.");
                // The reservation is returned before the client learns of
                // the failure.
                drop(reservation);
                let _ = protocol::write_decision(
                    &mut stream,
                    PortDecision::Rejected(ControlCode::Internal),
                )
                .await;
                return;
            }
        };
        if let Err(error) =
            protocol::write_decision(&mut stream, PortDecision::Assigned(port)).await
        {
            warn!(session = self.session, port, %error, "Error sending port assignment.");
            return;
        }
        info!(session = self.session, peer = %self.peer, port, "Tunnel established.");
        let whitelist = AddressMatcher::new(&request.whitelist);
        self.serve(listener, whitelist, port).await;
        drop(reservation);
        info!(session = self.session, port, "Tunnel closed. Port released.");
    }

    async fn serve(&self, listener: TcpListener, whitelist: AddressMatcher, port: u16) {
        let mut bridges = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, address)) => {
                        self.dispatch(&mut bridges, &whitelist, port, stream, address);
                    }
                    Err(error) if is_transient_accept_error(&error) => {
                        warn!(port, %error, "Transient accept error on public port.");
                        sleep(ACCEPT_BACKOFF).await;
                    }
                    Err(error) => {
                        warn!(port, %error, "Fatal accept error on public port.");
                        break;
                    }
                }
            }
        }
        // The port must stop accepting before the drain starts.
        drop(listener);
        while bridges.join_next().await.is_some() {}
    }

    fn dispatch(
        &self,
        bridges: &mut JoinSet<()>,
        whitelist: &AddressMatcher,
        port: u16,
        stream: TcpStream,
        address: SocketAddr,
    ) {
        let source = address.ip().to_canonical().to_string();
        if !whitelist.admits(&source) {
            info!(%address, port, "Rejecting connection: source not in whitelist.");
            return;
        }
        debug!(%address, port, "New connection to public port.");
        bridges.spawn(bridge(
            stream,
            self.handle.clone(),
            self.server.bind_address.clone(),
            source,
            address,
            port,
            self.cancellation_token.clone(),
        ));
    }
}

// One public connection bridged to one channel, opened here so a slow
// channel open never blocks the accept loop. Both copy directions run
// until their source ends, each half-closing its destination; session
// termination aborts the bridge outright.
async fn bridge(
    mut stream: TcpStream,
    handle: Handle,
    bind_address: String,
    source: String,
    address: SocketAddr,
    port: u16,
    cancellation_token: CancellationToken,
) {
    let channel = match handle
        .channel_open_forwarded_tcpip(bind_address, port.into(), source, address.port().into())
        .await
    {
        Ok(channel) => channel,
        Err(error) => {
            warn!(%address, port, %error, "Error opening channel to client.");
            return;
        }
    };
    let mut channel = channel.into_stream();
    tokio::select! {
        result = copy_bidirectional(&mut stream, &mut channel) => match result {
            Ok((to_client, to_public)) => {
                debug!(port, to_client, to_public, "Bridge closed.");
            }
            Err(error) => debug!(port, %error, "Bridge ended with error."),
        },
        _ = cancellation_token.cancelled() => {
            debug!(port, "Bridge aborted: session closed.");
        }
    }
}
