use clap::Parser;
use clap::error::ErrorKind;
use pbp_tunnel::{
    client,
    config::{self, Cli, Command, RunMode},
    server,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => error.exit(),
            _ => {
                let _ = error.print();
                std::process::exit(1);
            }
        },
    };
    match cli.command {
        Some(Command::Client(args)) => client::run(config::client_parameters(args)).await,
        Some(Command::Server(args)) => server::run(config::server_parameters(args)).await,
        Some(Command::Generate) => config::generate_config(),
        None => match config::infer_mode() {
            Some(RunMode::Client(params)) => client::run(params).await,
            Some(RunMode::Server(params)) => server::run(params).await,
            None => {
                eprintln!(
                    "No subcommand given and no usable configuration found.\n\
                     Run 'pbp-tunnel --help' for usage."
                );
                std::process::exit(1);
            }
        },
    }
}
