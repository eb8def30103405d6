use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TunnelError;

/// Control codes exchanged on the handshake channel. Every frame is a
/// big-endian u32; error replies to the port request additionally carry
/// [`ERROR_MASK`] in the high bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlCode {
    Success = 0,
    PortUnavailable = 1,
    IpNotAllowed = 2,
    PortOutOfRange = 3,
    Internal = 4,
}

/// High bit distinguishing error codes from assigned port numbers, which
/// always fit in the low 16 bits.
pub const ERROR_MASK: u32 = 0x8000_0000;

impl ControlCode {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ControlCode::Success),
            1 => Some(ControlCode::PortUnavailable),
            2 => Some(ControlCode::IpNotAllowed),
            3 => Some(ControlCode::PortOutOfRange),
            4 => Some(ControlCode::Internal),
            _ => None,
        }
    }
}

/// Outcome of the server's port assignment as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDecision {
    Assigned(u16),
    Rejected(ControlCode),
}

impl PortDecision {
    pub fn encode(self) -> u32 {
        match self {
            PortDecision::Assigned(port) => port.into(),
            PortDecision::Rejected(code) => ERROR_MASK | code as u32,
        }
    }

    /// Returns `None` for values that are neither a valid port nor a known
    /// error code.
    pub fn decode(value: u32) -> Option<Self> {
        if value & ERROR_MASK == 0 {
            u16::try_from(value).ok().map(PortDecision::Assigned)
        } else {
            ControlCode::from_u32(value & !ERROR_MASK).map(PortDecision::Rejected)
        }
    }
}

/// What a client asked for during the handshake: the whitelist to apply to
/// its public port, and the port it wants (0 lets the server pick).
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct TunnelRequest {
    pub(crate) whitelist: Vec<String>,
    pub(crate) requested_port: u32,
}

async fn write_code<W>(writer: &mut W, code: ControlCode) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(code as u32).await?;
    writer.flush().await
}

async fn write_whitelist<W>(writer: &mut W, entries: &[String]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(entries.len() as u32).await?;
    for entry in entries {
        writer.write_u32(entry.len() as u32).await?;
        writer.write_all(entry.as_bytes()).await?;
    }
    writer.flush().await
}

async fn read_whitelist<R>(reader: &mut R) -> io::Result<Vec<String>>
where
    R: AsyncRead + Unpin,
{
    let count = reader.read_u32().await?;
    let mut entries = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let length = reader.read_u32().await? as usize;
        let mut buffer = vec![0u8; length];
        reader.read_exact(&mut buffer).await?;
        // UTF-8 is expected but not enforced on the wire.
        entries.push(String::from_utf8_lossy(&buffer).into_owned());
    }
    Ok(entries)
}

/// Server half of the control dialogue, up to (but not including) the port
/// reply: admission verdict, whitelist exchange, and port request. The
/// caller answers with [`write_decision`] once allocation and binding have
/// settled. Any short read or write aborts the session.
pub(crate) async fn negotiate_incoming<S>(
    stream: &mut S,
    peer_admitted: bool,
) -> Result<TunnelRequest, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !peer_admitted {
        write_code(stream, ControlCode::IpNotAllowed).await?;
        return Err(TunnelError::PeerRejected);
    }
    write_code(stream, ControlCode::Success).await?;
    let whitelist = read_whitelist(stream).await?;
    write_code(stream, ControlCode::Success).await?;
    let requested_port = stream.read_u32().await?;
    Ok(TunnelRequest {
        whitelist,
        requested_port,
    })
}

pub(crate) async fn write_decision<W>(writer: &mut W, decision: PortDecision) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(decision.encode()).await?;
    writer.flush().await
}

/// Client half of the control dialogue. Runs all four steps and returns the
/// port the server bound, or the reason it refused.
pub(crate) async fn negotiate_outgoing<S>(
    stream: &mut S,
    whitelist: &[String],
    requested_port: u16,
) -> Result<u16, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let admission = stream.read_u32().await?;
    match ControlCode::from_u32(admission) {
        Some(ControlCode::Success) => {}
        Some(ControlCode::IpNotAllowed) => return Err(TunnelError::IpRejected),
        _ => return Err(TunnelError::UnexpectedCode(admission)),
    }
    write_whitelist(stream, whitelist).await?;
    let confirmation = stream.read_u32().await?;
    if confirmation != ControlCode::Success as u32 {
        return Err(TunnelError::WhitelistRejected(confirmation));
    }
    stream.write_u32(requested_port.into()).await?;
    stream.flush().await?;
    let reply = stream.read_u32().await?;
    match PortDecision::decode(reply) {
        Some(PortDecision::Assigned(port)) => Ok(port),
        Some(PortDecision::Rejected(ControlCode::PortUnavailable)) => {
            Err(TunnelError::NoAvailablePorts)
        }
        Some(PortDecision::Rejected(ControlCode::PortOutOfRange)) => {
            Err(TunnelError::PortOutOfRange)
        }
        Some(PortDecision::Rejected(ControlCode::Internal)) => Err(TunnelError::ServerInternal),
        _ => Err(TunnelError::UnexpectedCode(reply)),
    }
}

#[cfg(test)]
mod protocol_tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use crate::error::TunnelError;

    use super::{
        ControlCode, ERROR_MASK, PortDecision, negotiate_incoming, negotiate_outgoing,
        write_decision,
    };

    #[test]
    fn encodes_assigned_ports_with_high_bit_clear() {
        assert_eq!(PortDecision::Assigned(0).encode(), 0);
        assert_eq!(PortDecision::Assigned(10000).encode(), 10000);
        assert_eq!(PortDecision::Assigned(65535).encode(), 65535);
    }

    #[test]
    fn encodes_rejections_with_high_bit_set() {
        assert_eq!(
            PortDecision::Rejected(ControlCode::PortUnavailable).encode(),
            0x8000_0001
        );
        assert_eq!(
            PortDecision::Rejected(ControlCode::PortOutOfRange).encode(),
            0x8000_0003
        );
        assert_eq!(
            PortDecision::Rejected(ControlCode::Internal).encode(),
            0x8000_0004
        );
    }

    #[test]
    fn decode_is_the_inverse_of_encode() {
        for decision in [
            PortDecision::Assigned(1),
            PortDecision::Assigned(49152),
            PortDecision::Rejected(ControlCode::PortUnavailable),
            PortDecision::Rejected(ControlCode::IpNotAllowed),
            PortDecision::Rejected(ControlCode::Internal),
        ] {
            assert_eq!(PortDecision::decode(decision.encode()), Some(decision));
        }
    }

    #[test]
    fn decode_rejects_malformed_values() {
        assert_eq!(PortDecision::decode(0x0001_0000), None);
        assert_eq!(PortDecision::decode(ERROR_MASK | 99), None);
    }

    #[tokio::test]
    async fn four_step_dialogue_assigns_port() {
        let (mut client_end, mut server_end) = duplex(1024);
        let server = tokio::spawn(async move {
            let request = negotiate_incoming(&mut server_end, true).await.unwrap();
            assert_eq!(request.whitelist, vec!["10.0.0.0/8".to_string()]);
            assert_eq!(request.requested_port, 0);
            write_decision(&mut server_end, PortDecision::Assigned(10000))
                .await
                .unwrap();
        });
        let port = negotiate_outgoing(&mut client_end, &["10.0.0.0/8".into()], 0)
            .await
            .unwrap();
        assert_eq!(port, 10000);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_peer_reads_ip_not_allowed() {
        let (mut client_end, mut server_end) = duplex(1024);
        let server = tokio::spawn(async move {
            let error = negotiate_incoming(&mut server_end, false).await.unwrap_err();
            assert!(matches!(error, TunnelError::PeerRejected));
        });
        let error = negotiate_outgoing(&mut client_end, &[], 0).await.unwrap_err();
        assert!(matches!(error, TunnelError::IpRejected));
        assert_eq!(error.to_string(), "server rejected IP");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn out_of_range_reply_aborts_the_client() {
        let (mut client_end, mut server_end) = duplex(1024);
        let server = tokio::spawn(async move {
            let request = negotiate_incoming(&mut server_end, true).await.unwrap();
            assert_eq!(request.requested_port, 9999);
            write_decision(
                &mut server_end,
                PortDecision::Rejected(ControlCode::PortOutOfRange),
            )
            .await
            .unwrap();
        });
        let error = negotiate_outgoing(&mut client_end, &[], 9999)
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "server: port out of range");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn collision_reply_maps_to_no_available_ports() {
        let (mut client_end, mut server_end) = duplex(1024);
        tokio::spawn(async move {
            let _ = negotiate_incoming(&mut server_end, true).await.unwrap();
            write_decision(
                &mut server_end,
                PortDecision::Rejected(ControlCode::PortUnavailable),
            )
            .await
            .unwrap();
        });
        let error = negotiate_outgoing(&mut client_end, &[], 10000)
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "server: no available ports");
    }

    #[tokio::test]
    async fn non_success_whitelist_confirmation_is_a_protocol_error() {
        let (mut client_end, mut server_end) = duplex(1024);
        tokio::spawn(async move {
            server_end.write_u32(0).await.unwrap();
            let _ = read_to_end_of_whitelist(&mut server_end).await;
            server_end.write_u32(4).await.unwrap();
        });
        let error = negotiate_outgoing(&mut client_end, &["192.0.2.1".into()], 0)
            .await
            .unwrap_err();
        assert!(matches!(error, TunnelError::WhitelistRejected(4)));
    }

    #[tokio::test]
    async fn truncated_dialogue_fails_with_io_error() {
        let (mut client_end, server_end) = duplex(1024);
        // The server vanishes before sending the admission verdict.
        drop(server_end);
        let error = negotiate_outgoing(&mut client_end, &[], 0).await.unwrap_err();
        assert!(matches!(error, TunnelError::Io(_)));
    }

    async fn read_to_end_of_whitelist<S>(stream: &mut S)
    where
        S: tokio::io::AsyncRead + Unpin,
    {
        let count = stream.read_u32().await.unwrap();
        for _ in 0..count {
            let length = stream.read_u32().await.unwrap() as usize;
            let mut buffer = vec![0u8; length];
            stream.read_exact(&mut buffer).await.unwrap();
        }
    }
}
