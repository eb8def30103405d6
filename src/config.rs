use std::{
    env, fs,
    io::{BufRead, Write, stdin, stdout},
    path::Path,
    str::FromStr,
};

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Context, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::TunnelError,
    keys::{self, HostKeyAlgorithm},
};

/// Default SSH port for both roles.
pub const DEFAULT_ENDPOINT_PORT: u16 = 52135;

const ENV_PREFIX: &str = "PBP_TUNNEL";

// CLI surface. Flags mirror the parameter structs; anything left unset
// falls back to the environment, then the JSON config file, then defaults.
#[derive(Debug, Parser)]
#[command(name = "pbp-tunnel", version, about = "Reverse port-forwarding over SSH", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Expose a local service through a remote tunnel server.
    Client(ClientArgs),
    /// Accept tunnel clients and publish their ports.
    Server(ServerArgs),
    /// Interactively generate a configuration file.
    Generate,
}

#[derive(Debug, Default, Args, PartialEq)]
pub struct ClientArgs {
    /// Tunnel server to connect to.
    #[arg(long, value_name = "HOST")]
    pub endpoint: Option<String>,

    /// SSH port on the tunnel server.
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// SSH username.
    #[arg(long, value_name = "USER")]
    pub username: Option<String>,

    /// SSH password.
    #[arg(long, value_name = "PASSWORD")]
    pub password: Option<String>,

    /// Path to the private key used for public-key authentication.
    #[arg(long, value_name = "FILE")]
    pub identity: Option<String>,

    /// Path to the expected server host key(s), for strict verification.
    #[arg(long, value_name = "FILE")]
    pub host_key: Option<String>,

    /// Host of the local service to expose.
    #[arg(long, value_name = "HOST")]
    pub local_host: Option<String>,

    /// Port of the local service to expose.
    #[arg(long, value_name = "PORT")]
    pub local_port: Option<u16>,

    /// Public port to request; 0 lets the server pick one.
    #[arg(long, value_name = "PORT")]
    pub remote_port: Option<u16>,

    /// Host key verification: 0 = none, 1 = warn, 2 = strict.
    #[arg(long, value_name = "LEVEL")]
    pub host_key_level: Option<u8>,

    /// Source addresses allowed to connect to the public port.
    #[arg(long, value_delimiter = ',', value_name = "IP|CIDR")]
    pub allowed_ips: Option<Vec<String>>,
}

#[derive(Debug, Default, Args, PartialEq)]
pub struct ServerArgs {
    /// Address to bind the SSH listener and all public ports to.
    #[arg(long, value_name = "ADDRESS")]
    pub bind: Option<String>,

    /// Port to listen on for SSH connections.
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Lowest public port that may be assigned.
    #[arg(long, value_name = "PORT")]
    pub port_range_start: Option<u16>,

    /// Highest public port that may be assigned.
    #[arg(long, value_name = "PORT")]
    pub port_range_end: Option<u16>,

    /// SSH username clients must present.
    #[arg(long, value_name = "USER")]
    pub username: Option<String>,

    /// SSH password clients may authenticate with.
    #[arg(long, value_name = "PASSWORD")]
    pub password: Option<String>,

    /// Path to the RSA host key; generated if missing.
    #[arg(long, value_name = "FILE")]
    pub private_rsa: Option<String>,

    /// Path to the ECDSA host key; generated if missing.
    #[arg(long, value_name = "FILE")]
    pub private_ecdsa: Option<String>,

    /// Path to the Ed25519 host key; generated if missing.
    #[arg(long, value_name = "FILE")]
    pub private_ed25519: Option<String>,

    /// Path to an OpenSSH authorized_keys file for public-key logins.
    #[arg(long, value_name = "FILE")]
    pub authorized_keys: Option<String>,

    /// SSH peer addresses admitted to request tunnels.
    #[arg(long, value_delimiter = ',', value_name = "IP|CIDR")]
    pub allowed_ips: Option<Vec<String>>,
}

/// Root of the JSON configuration file.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(rename = "type")]
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientParameters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerParameters>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientParameters {
    pub endpoint: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub identity: String,
    pub host_key: String,
    pub local_host: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub host_key_level: u8,
    pub allowed_ips: Vec<String>,
}

impl Default for ClientParameters {
    fn default() -> Self {
        ClientParameters {
            endpoint: String::new(),
            port: DEFAULT_ENDPOINT_PORT,
            username: String::new(),
            password: String::new(),
            identity: String::new(),
            host_key: String::new(),
            local_host: "localhost".into(),
            local_port: 80,
            remote_port: 0,
            host_key_level: 2,
            allowed_ips: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerParameters {
    pub bind: String,
    pub port: u16,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub username: String,
    pub password: String,
    pub private_rsa: String,
    pub private_ecdsa: String,
    pub private_ed25519: String,
    pub authorized_keys: String,
    pub allowed_ips: Vec<String>,
}

impl Default for ServerParameters {
    fn default() -> Self {
        ServerParameters {
            bind: "0.0.0.0".into(),
            port: DEFAULT_ENDPOINT_PORT,
            port_range_start: 49152,
            port_range_end: 65535,
            username: String::new(),
            password: String::new(),
            private_rsa: "id_rsa".into(),
            private_ecdsa: String::new(),
            private_ed25519: String::new(),
            authorized_keys: String::new(),
            allowed_ips: Vec::new(),
        }
    }
}

/// Fetch `PBP_TUNNEL_<KEY>`, with `-` and `.` in the key mapped to `_`.
/// Empty values count as unset.
fn env_value(key: &str) -> Option<String> {
    let env_key = format!(
        "{ENV_PREFIX}_{}",
        key.to_uppercase().replace(['-', '.'], "_")
    );
    env::var(env_key).ok().filter(|value| !value.is_empty())
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    env_value(key).and_then(|value| value.parse().ok())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

impl ClientParameters {
    pub(crate) fn apply_env(&mut self) {
        if let Some(value) = env_value("endpoint") {
            self.endpoint = value;
        }
        if let Some(value) = env_parsed("port") {
            self.port = value;
        }
        if let Some(value) = env_value("username") {
            self.username = value;
        }
        if let Some(value) = env_value("password") {
            self.password = value;
        }
        if let Some(value) = env_value("identity") {
            self.identity = value;
        }
        if let Some(value) = env_value("host_key") {
            self.host_key = value;
        }
        if let Some(value) = env_value("local_host") {
            self.local_host = value;
        }
        if let Some(value) = env_parsed("local_port") {
            self.local_port = value;
        }
        if let Some(value) = env_parsed("remote_port") {
            self.remote_port = value;
        }
        if let Some(value) = env_parsed("host_key_level") {
            self.host_key_level = value;
        }
        if let Some(value) = env_value("allowed_ips") {
            self.allowed_ips = split_list(&value);
        }
    }

    fn apply_args(&mut self, args: ClientArgs) {
        if let Some(value) = args.endpoint {
            self.endpoint = value;
        }
        if let Some(value) = args.port {
            self.port = value;
        }
        if let Some(value) = args.username {
            self.username = value;
        }
        if let Some(value) = args.password {
            self.password = value;
        }
        if let Some(value) = args.identity {
            self.identity = value;
        }
        if let Some(value) = args.host_key {
            self.host_key = value;
        }
        if let Some(value) = args.local_host {
            self.local_host = value;
        }
        if let Some(value) = args.local_port {
            self.local_port = value;
        }
        if let Some(value) = args.remote_port {
            self.remote_port = value;
        }
        if let Some(value) = args.host_key_level {
            self.host_key_level = value;
        }
        if let Some(value) = args.allowed_ips {
            self.allowed_ips = value;
        }
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.endpoint.is_empty() {
            return Err(TunnelError::InvalidConfig("endpoint is required".into()));
        }
        if self.port == 0 {
            return Err(TunnelError::InvalidConfig(
                "endpoint port must be between 1 and 65535".into(),
            ));
        }
        if self.username.is_empty() {
            return Err(TunnelError::InvalidConfig("username is required".into()));
        }
        if self.identity.is_empty() && self.password.is_empty() {
            return Err(TunnelError::InvalidConfig(
                "either identity or password must be set".into(),
            ));
        }
        if !self.identity.is_empty() && !self.password.is_empty() {
            return Err(TunnelError::InvalidConfig(
                "only one of identity or password may be set".into(),
            ));
        }
        if self.local_host.is_empty() {
            return Err(TunnelError::InvalidConfig("local_host is required".into()));
        }
        if self.local_port == 0 {
            return Err(TunnelError::InvalidConfig(
                "local_port must be between 1 and 65535".into(),
            ));
        }
        if self.host_key_level > 2 {
            return Err(TunnelError::InvalidConfig(
                "host_key_level must be 0, 1, or 2".into(),
            ));
        }
        Ok(())
    }
}

impl ServerParameters {
    pub(crate) fn apply_env(&mut self) {
        if let Some(value) = env_value("bind") {
            self.bind = value;
        }
        if let Some(value) = env_parsed("port") {
            self.port = value;
        }
        if let Some(value) = env_parsed("port_range_start") {
            self.port_range_start = value;
        }
        if let Some(value) = env_parsed("port_range_end") {
            self.port_range_end = value;
        }
        if let Some(value) = env_value("username") {
            self.username = value;
        }
        if let Some(value) = env_value("password") {
            self.password = value;
        }
        if let Some(value) = env_value("private_rsa") {
            self.private_rsa = value;
        }
        if let Some(value) = env_value("private_ecdsa") {
            self.private_ecdsa = value;
        }
        if let Some(value) = env_value("private_ed25519") {
            self.private_ed25519 = value;
        }
        if let Some(value) = env_value("authorized_keys") {
            self.authorized_keys = value;
        }
        if let Some(value) = env_value("allowed_ips") {
            self.allowed_ips = split_list(&value);
        }
    }

    fn apply_args(&mut self, args: ServerArgs) {
        if let Some(value) = args.bind {
            self.bind = value;
        }
        if let Some(value) = args.port {
            self.port = value;
        }
        if let Some(value) = args.port_range_start {
            self.port_range_start = value;
        }
        if let Some(value) = args.port_range_end {
            self.port_range_end = value;
        }
        if let Some(value) = args.username {
            self.username = value;
        }
        if let Some(value) = args.password {
            self.password = value;
        }
        if let Some(value) = args.private_rsa {
            self.private_rsa = value;
        }
        if let Some(value) = args.private_ecdsa {
            self.private_ecdsa = value;
        }
        if let Some(value) = args.private_ed25519 {
            self.private_ed25519 = value;
        }
        if let Some(value) = args.authorized_keys {
            self.authorized_keys = value;
        }
        if let Some(value) = args.allowed_ips {
            self.allowed_ips = value;
        }
    }

    /// Validate the parameters. Missing host-key files are generated here,
    /// before any session handling starts.
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.bind.is_empty() {
            return Err(TunnelError::InvalidConfig("bind address is required".into()));
        }
        if self.port == 0 {
            return Err(TunnelError::InvalidConfig(
                "bind port must be between 1 and 65535".into(),
            ));
        }
        if self.port_range_end < self.port_range_start {
            return Err(TunnelError::InvalidConfig(
                "port_range_end must be between port_range_start and 65535".into(),
            ));
        }
        if self.username.is_empty() {
            return Err(TunnelError::InvalidConfig(
                "username must be set for SSH server".into(),
            ));
        }
        if self.password.is_empty() && self.authorized_keys.is_empty() {
            return Err(TunnelError::InvalidConfig(
                "password or authorized_keys must be set for SSH server".into(),
            ));
        }
        if self.private_rsa.is_empty()
            && self.private_ecdsa.is_empty()
            && self.private_ed25519.is_empty()
        {
            return Err(TunnelError::InvalidConfig(
                "at least one host key path must be provided".into(),
            ));
        }
        self.ensure_host_keys().map_err(|error| {
            TunnelError::InvalidConfig(format!("failed to assert or generate host key: {error}"))
        })
    }

    fn ensure_host_keys(&self) -> color_eyre::Result<()> {
        for (path, algorithm) in self.host_key_paths() {
            keys::load_or_generate_host_key(Path::new(path), algorithm)?;
        }
        Ok(())
    }

    pub(crate) fn host_key_paths(&self) -> impl Iterator<Item = (&str, HostKeyAlgorithm)> {
        [
            (self.private_rsa.as_str(), HostKeyAlgorithm::Rsa),
            (self.private_ecdsa.as_str(), HostKeyAlgorithm::Ecdsa),
            (self.private_ed25519.as_str(), HostKeyAlgorithm::Ed25519),
        ]
        .into_iter()
        .filter(|(path, _)| !path.is_empty())
    }
}

/// Read the JSON configuration file, if any. The path comes from
/// `PBP_TUNNEL_CONFIG`, else `config.json` in the working directory; a
/// missing file falls back to an empty configuration.
pub fn load_config() -> AppConfig {
    let path = env_value("config").unwrap_or_else(|| "config.json".into());
    match fs::read_to_string(&path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(config) => config,
            Err(error) => {
                warn!(%path, %error, "Error parsing config file. Ignoring it.");
                AppConfig::default()
            }
        },
        Err(_) => AppConfig::default(),
    }
}

/// Resolved parameters for the `client` subcommand: file, then environment,
/// then flags.
pub fn client_parameters(args: ClientArgs) -> ClientParameters {
    let mut params = load_config().client.unwrap_or_default();
    params.apply_env();
    params.apply_args(args);
    params
}

/// Resolved parameters for the `server` subcommand.
pub fn server_parameters(args: ServerArgs) -> ServerParameters {
    let mut params = load_config().server.unwrap_or_default();
    params.apply_env();
    params.apply_args(args);
    params
}

/// Which role to run when no subcommand is given.
pub enum RunMode {
    Client(ClientParameters),
    Server(ServerParameters),
}

/// Infer the role from the configuration file's `type` field.
pub fn infer_mode() -> Option<RunMode> {
    let config = load_config();
    match config.mode.as_str() {
        "client" => {
            let mut params = config.client.unwrap_or_default();
            params.apply_env();
            Some(RunMode::Client(params))
        }
        "server" => {
            let mut params = config.server.unwrap_or_default();
            params.apply_env();
            Some(RunMode::Server(params))
        }
        _ => None,
    }
}

/// Interactively prompt for the common fields and write a configuration
/// file.
pub fn generate_config() -> color_eyre::Result<()> {
    let mode = ask("Generate config for (client/server)", "client")?;
    let mut config = AppConfig {
        mode: mode.clone(),
        ..Default::default()
    };
    match mode.as_str() {
        "client" => {
            config.client = Some(ClientParameters {
                host_key_level: ask_parsed("Host key level", 2u8)?,
                endpoint: ask("Server endpoint", "127.0.0.1")?,
                port: ask_parsed("Server port", DEFAULT_ENDPOINT_PORT)?,
                username: ask("Username", "user")?,
                password: ask("Password", "changeme")?,
                local_host: ask("Local host to forward", "localhost")?,
                local_port: ask_parsed("Local port", 8080u16)?,
                remote_port: ask_parsed("Remote port to request", 0u16)?,
                ..Default::default()
            });
        }
        "server" => {
            let mut server = ServerParameters {
                bind: ask("Bind address", "0.0.0.0")?,
                port: ask_parsed("Bind port", DEFAULT_ENDPOINT_PORT)?,
                port_range_start: ask_parsed("Port range start", 49152u16)?,
                port_range_end: ask_parsed("Port range end", 65535u16)?,
                username: ask("Username", "user")?,
                password: ask("Password", "changeme")?,
                private_rsa: ask("Private key path", "id_rsa")?,
                ..Default::default()
            };
            let allowed = ask("Allowed IPs (comma separated)", "")?;
            if !allowed.is_empty() {
                server.allowed_ips = split_list(&allowed);
            }
            config.server = Some(server);
        }
        other => bail!("unknown configuration type {other:?}"),
    }
    let output = ask("Output file path", "config.json")?;
    let data = serde_json::to_string_pretty(&config).with_context(|| "Error encoding config")?;
    fs::write(&output, data).with_context(|| format!("Error creating file {output}"))?;
    println!("Configuration written to {output}");
    Ok(())
}

fn ask(prompt: &str, default: &str) -> color_eyre::Result<String> {
    print!("{prompt} [{default}]: ");
    stdout().flush()?;
    let mut input = String::new();
    stdin().lock().read_line(&mut input)?;
    let input = input.trim();
    Ok(if input.is_empty() {
        default.to_string()
    } else {
        input.to_string()
    })
}

fn ask_parsed<T: FromStr + ToString + Copy>(prompt: &str, default: T) -> color_eyre::Result<T> {
    let value = ask(prompt, &default.to_string())?;
    Ok(value.parse().unwrap_or_else(|_| {
        println!("Invalid value, using default: {}", default.to_string());
        default
    }))
}
