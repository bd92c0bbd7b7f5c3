use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use mc_tunnel::config::TunnelConfig;
use mc_tunnel::establish::ConnectionEstablisher;
use mc_tunnel::observer::{ChannelObserver, Observer, ObserverEvent, TracingObserver};
use mc_tunnel::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use mc_tunnel::token_file::{self, invite_path};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::debug;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("logging initialization failed")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = TunnelConfig::from_env();
    match cli.command {
        Command::Host(args) => handle_host(config, cli.quiet, args).await,
        Command::Join(args) => handle_join(config, cli.quiet, args).await,
        Command::Export(args) => {
            let token = args.token.trim();
            if token.is_empty() {
                bail!("refusing to export an empty token");
            }
            let path = invite_path(&args.path);
            token_file::export_to_file(token, &path, config.file_io_timeout).await?;
            eprintln!("💾 token written to {}", path.display());
            Ok(())
        }
        Command::Import(args) => {
            let token = token_file::import_from_file(&args.path, config.file_io_timeout).await?;
            println!("{}", token.trim_end());
            Ok(())
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "mc-tunnel",
    about = "⛏️  Share a local game server peer-to-peer with copy-paste invites",
    author,
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[arg(
        long,
        global = true,
        action = clap::ArgAction::SetTrue,
        help = "Send connection status to the log instead of the terminal"
    )]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "MC_TUNNEL_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "MC_TUNNEL_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Expose the local game server; prints an invite for the joiner
    Host(HostArgs),
    /// Accept a host's invite and listen for local game clients
    Join(JoinArgs),
    /// Save a token to an invite file
    Export(ExportArgs),
    /// Print the token stored in an invite file
    Import(ImportArgs),
}

#[derive(Args, Debug)]
struct HostArgs {
    #[arg(
        long,
        value_name = "ADDR",
        help = "Game server address to expose (defaults to localhost:25565)"
    )]
    target: Option<String>,

    #[arg(
        long = "offer-out",
        value_name = "PATH",
        help = "Write the invite to a file instead of printing it"
    )]
    offer_out: Option<PathBuf>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Read the joiner's answer from a file ('-' or omitted reads stdin)"
    )]
    answer: Option<String>,
}

#[derive(Args, Debug)]
struct JoinArgs {
    #[arg(long, value_name = "PORT", help = "Local port for game clients (defaults to 25565)")]
    port: Option<u16>,

    #[arg(
        long,
        value_name = "TOKEN",
        conflicts_with = "offer_file",
        required_unless_present = "offer_file",
        help = "The host's invite token"
    )]
    offer: Option<String>,

    #[arg(long = "offer-file", value_name = "PATH", help = "Read the host's invite from a file")]
    offer_file: Option<PathBuf>,

    #[arg(
        long = "answer-out",
        value_name = "PATH",
        help = "Write the answer to a file instead of printing it"
    )]
    answer_out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[arg(long, value_name = "TOKEN")]
    token: String,

    #[arg(long, value_name = "PATH")]
    path: PathBuf,
}

#[derive(Args, Debug)]
struct ImportArgs {
    #[arg(long, value_name = "PATH")]
    path: PathBuf,
}

async fn handle_host(mut config: TunnelConfig, quiet: bool, args: HostArgs) -> anyhow::Result<()> {
    if let Some(target) = args.target {
        config.host_target = target;
    }
    let file_timeout = config.file_io_timeout;
    let establisher = ConnectionEstablisher::new(config, observer(quiet))?;

    eprintln!("🔎 gathering connection candidates...");
    let offer = establisher.create_offer().await?;
    match &args.offer_out {
        Some(path) => {
            let path = invite_path(path);
            token_file::export_to_file(offer.as_str(), &path, file_timeout).await?;
            eprintln!("📨 invite written to {}; send it to your friend", path.display());
        }
        None => {
            eprintln!("📨 send this invite to your friend:\n");
            println!("{offer}");
            eprintln!();
        }
    }

    let answer = match args.answer.as_deref() {
        Some(path) if path != "-" => token_file::import_from_file(path, file_timeout).await?,
        _ => read_token_line("📥 paste their answer and press enter:").await?,
    };
    establisher.accept_answer(&answer).await?;
    eprintln!("🤝 answer accepted; waiting for the tunnel (Ctrl-C to quit)");

    wait_for_ctrl_c().await;
    establisher.shutdown().await;
    Ok(())
}

async fn handle_join(mut config: TunnelConfig, quiet: bool, args: JoinArgs) -> anyhow::Result<()> {
    if let Some(port) = args.port {
        config.joiner_port = port;
    }
    let file_timeout = config.file_io_timeout;
    let offer = match (&args.offer, &args.offer_file) {
        (Some(token), _) => token.clone(),
        (None, Some(path)) => token_file::import_from_file(path, file_timeout).await?,
        (None, None) => bail!("either --offer or --offer-file is required"),
    };

    let joiner_addr = config.joiner_addr();
    let establisher = ConnectionEstablisher::new(config, observer(quiet))?;
    eprintln!("🔎 answering invite...");
    let answer = establisher.accept_offer(&offer).await?;
    match &args.answer_out {
        Some(path) => {
            write_answer(answer.as_str(), path, file_timeout).await?;
        }
        None => {
            eprintln!("📨 send this answer back to the host:\n");
            println!("{answer}");
            eprintln!();
        }
    }
    eprintln!("🎮 once connected, point your game at {joiner_addr} (Ctrl-C to quit)");

    wait_for_ctrl_c().await;
    establisher.shutdown().await;
    Ok(())
}

async fn write_answer(
    answer: &str,
    path: &Path,
    timeout: std::time::Duration,
) -> anyhow::Result<()> {
    let path = invite_path(path);
    token_file::export_to_file(answer, &path, timeout).await?;
    eprintln!("📨 answer written to {}; send it back to the host", path.display());
    Ok(())
}

fn observer(quiet: bool) -> Arc<dyn Observer> {
    if quiet {
        return Arc::new(TracingObserver);
    }
    let (observer, mut events) = ChannelObserver::new();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ObserverEvent::Status(status) => eprintln!("● status: {status}"),
                ObserverEvent::Log(message) => eprintln!("  {message}"),
            }
        }
    });
    Arc::new(observer)
}

async fn read_token_line(prompt: &str) -> anyhow::Result<String> {
    if io::stdin().is_terminal() {
        eprintln!("{prompt}");
    }
    read_token_from(BufReader::new(tokio::io::stdin())).await
}

async fn read_token_from<R>(reader: R) -> anyhow::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let line = reader
        .lines()
        .next_line()
        .await
        .context("failed to read token from stdin")?
        .unwrap_or_default();
    let token = line.trim().to_string();
    if token.is_empty() {
        bail!("no token provided");
    }
    Ok(token)
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "ctrl-c handler unavailable; shutting down");
    }
    eprintln!("👋 shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn join_requires_an_offer() {
        assert!(Cli::try_parse_from(["mc-tunnel", "join"]).is_err());
        let cli = Cli::try_parse_from(["mc-tunnel", "join", "--offer", "abc", "--port", "0"])
            .unwrap();
        match cli.command {
            Command::Join(args) => {
                assert_eq!(args.offer.as_deref(), Some("abc"));
                assert_eq!(args.port, Some(0));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn token_line_is_trimmed_and_stops_at_newline() {
        let token = read_token_from(&b"  bWMtdHVubmVs \r\nleftover\n"[..])
            .await
            .unwrap();
        assert_eq!(token, "bWMtdHVubmVs");
    }

    #[tokio::test]
    async fn empty_or_closed_input_is_rejected() {
        assert!(read_token_from(&b""[..]).await.is_err());
        assert!(read_token_from(&b"   \n"[..]).await.is_err());
    }

    #[test]
    fn offer_and_offer_file_conflict() {
        assert!(
            Cli::try_parse_from([
                "mc-tunnel",
                "join",
                "--offer",
                "abc",
                "--offer-file",
                "invite.mc-tunnel-invite"
            ])
            .is_err()
        );
    }
}
