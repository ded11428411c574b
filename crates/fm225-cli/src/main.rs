//! FM225 command line - drive a face module over a serial port

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use fm225_protocol::transport::BAUD_RATE;
use fm225_protocol::{
    CommandId, DeleteUserRequest, EnrollRequest, EnrollType, FaceDirection, FaceTransport,
    Outcome, ProtocolError, Request, TransportConfig, VerifyRequest,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod events;

const DEFAULT_PORT: &str = "/dev/ttyUSB0";

#[derive(Parser)]
#[command(name = "fm225", version, about = "Drive an FM225 face module over a serial port")]
struct Cli {
    /// Serial port [env: FM225_PORT, default: /dev/ttyUSB0]
    #[arg(long, short, global = true)]
    port: Option<String>,

    /// Baud rate [env: FM225_BAUD, default: 115200]
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// Wait up to this many seconds for the module's Ready note first
    #[arg(long, global = true)]
    wait_ready: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(flatten)]
    Request(RequestCommand),
    /// Print module notes and stray replies until Ctrl-C
    Listen,
    /// Print the encoded frame without opening a port
    Encode {
        #[command(subcommand)]
        request: RequestCommand,
    },
}

#[derive(Subcommand)]
enum RequestCommand {
    /// Register a new face
    Enroll(EnrollArgs),
    /// Match a live face against the library
    Verify(VerifyArgs),
    /// Remove one user
    DeleteUser {
        /// User id, 1 to 100
        user_id: u16,
    },
    /// Remove every user
    DeleteAll,
    /// Abort the running enroll or verify
    Reset,
}

#[derive(Args)]
struct EnrollArgs {
    /// User name, at most 32 bytes are sent
    name: String,
    /// Register as administrator
    #[arg(long)]
    admin: bool,
    #[arg(long, value_enum, default_value_t = Direction::Undefined)]
    direction: Direction,
    /// Capture a single frame instead of the interactive sequence
    #[arg(long)]
    single_frame: bool,
    /// Allow a face that is already enrolled
    #[arg(long)]
    allow_duplicate: bool,
    /// Device-side timeout in seconds (0 = module default, above 60 is clamped)
    #[arg(long, default_value_t = 10)]
    timeout: u8,
}

#[derive(Args)]
struct VerifyArgs {
    /// Ask the module to power down after a successful match
    #[arg(long)]
    power_down: bool,
    /// Device-side timeout in seconds (0 = module default, above 60 is clamped)
    #[arg(long, default_value_t = 10)]
    timeout: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum Direction {
    Undefined,
    Middle,
    Right,
    Left,
    Down,
    Up,
}

impl From<Direction> for FaceDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Undefined => FaceDirection::Undefined,
            Direction::Middle => FaceDirection::Middle,
            Direction::Right => FaceDirection::Right,
            Direction::Left => FaceDirection::Left,
            Direction::Down => FaceDirection::Down,
            Direction::Up => FaceDirection::Up,
        }
    }
}

impl RequestCommand {
    fn to_request(&self) -> Result<Request, ProtocolError> {
        Ok(match self {
            RequestCommand::Enroll(args) => Request::Enroll(EnrollRequest {
                admin: args.admin,
                direction: args.direction.into(),
                enroll_type: if args.single_frame {
                    EnrollType::SingleFrame
                } else {
                    EnrollType::Interactive
                },
                allow_duplicate: args.allow_duplicate,
                timeout_secs: args.timeout,
                ..EnrollRequest::new(args.name.as_bytes())
            }),
            RequestCommand::Verify(args) => {
                Request::Verify(VerifyRequest::new(args.power_down, args.timeout))
            }
            RequestCommand::DeleteUser { user_id } => {
                Request::DeleteUser(DeleteUserRequest::new(*user_id)?)
            }
            RequestCommand::DeleteAll => Request::DeleteAll,
            RequestCommand::Reset => Request::Reset,
        })
    }
}

/// Connection settings from flags, then environment, then defaults
struct Config {
    port: String,
    baud: u32,
}

impl Config {
    fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let port = cli
            .port
            .clone()
            .or_else(|| std::env::var("FM225_PORT").ok())
            .unwrap_or_else(|| DEFAULT_PORT.to_string());

        let baud = match cli.baud {
            Some(baud) => baud,
            None => match std::env::var("FM225_BAUD") {
                Ok(value) => value
                    .parse()
                    .with_context(|| format!("FM225_BAUD is not a number: {value}"))?,
                Err(_) => BAUD_RATE,
            },
        };

        Ok(Self { port, baud })
    }

    fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            baud_rate: self.baud,
            ..TransportConfig::default()
        }
    }
}

/// Result printed for every command, mirroring a JSON API response
#[derive(Serialize)]
struct CommandReport {
    command: CommandId,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl CommandReport {
    fn new(command: CommandId, result: Result<Outcome, ProtocolError>) -> Self {
        match result {
            Ok(outcome) => Self {
                command,
                success: outcome.is_success(),
                outcome: Some(outcome),
                error: None,
            },
            Err(e) => Self {
                command,
                success: false,
                outcome: None,
                error: Some(e.to_string()),
            },
        }
    }
}

fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fm225=info,fm225_protocol=debug,info".into()),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Encode { request } => {
            let data = request.to_request()?.encode()?;
            println!("{}", hex(&data));
            Ok(ExitCode::SUCCESS)
        }
        Command::Listen => {
            let (transport, config) = open(&cli).await?;
            events::listen(&transport, &config.port).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Request(command) => {
            // Reject bad arguments before touching the port
            let request = command.to_request()?;
            let (transport, _) = open(&cli).await?;
            let id = request.command_id();
            let result = match request {
                Request::Enroll(req) => transport.enroll(req).await,
                Request::Verify(req) => transport.verify(req).await,
                Request::DeleteUser(req) => transport.delete_user(req.user_id()).await,
                Request::DeleteAll => transport.delete_all().await,
                Request::Reset => transport.reset().await,
            };

            let report = CommandReport::new(id, result);
            println!("{}", serde_json::to_string(&report)?);
            Ok(if report.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

/// Open the configured port, waiting for Ready when asked to
async fn open(cli: &Cli) -> anyhow::Result<(FaceTransport, Config)> {
    let config = Config::resolve(cli)?;
    let transport = FaceTransport::connect(&config.port, config.transport_config())
        .await
        .with_context(|| format!("failed to open {}", config.port))?;

    if let Some(secs) = cli.wait_ready {
        tracing::info!("Waiting up to {}s for module Ready", secs);
        transport.wait_ready(Duration::from_secs(secs)).await?;
    }

    Ok((transport, config))
}
