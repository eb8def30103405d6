#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("peer address not allowed")]
    PeerRejected,
    #[error("server rejected IP")]
    IpRejected,
    #[error("whitelist rejected by server (code {0:#010x})")]
    WhitelistRejected(u32),
    #[error("server: no available ports")]
    NoAvailablePorts,
    #[error("server: port out of range")]
    PortOutOfRange,
    #[error("server: internal error")]
    ServerInternal,
    #[error("unexpected control code {0:#010x}")]
    UnexpectedCode(u32),
    #[error("authentication failed for {user}@{endpoint}")]
    AuthenticationFailed { user: String, endpoint: String },
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    // Whether the client supervisor may retry after this error. Handshake
    // rejections are final; transport and credential failures are not.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(
            self,
            TunnelError::AuthenticationFailed { .. } | TunnelError::Ssh(_) | TunnelError::Io(_)
        )
    }
}
