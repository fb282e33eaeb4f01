use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use qrauth::net::http::HttpTransport;
use qrauth::{
    ApiClient, ApiError, AuthError, AuthService, ClientConfig, ConfigError, FileTokenStore, LoginStatus, Navigator,
    QrChallenge, SessionStore, TokenStore, TransportError, UserProfile,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("login challenge expired; run `qrauth login` again")]
    ChallengeExpired,
    #[error("gave up waiting for authorization after {0} checks")]
    PollLimit(u32),
    #[error("not logged in; run `qrauth login` first")]
    NotLoggedIn,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "qrauth", about = "QR-code login session client")]
struct Cli {
    /// Overrides `QRAUTH_API_BASE`.
    #[arg(long)]
    base_url: Option<String>,

    /// File holding the bearer token.
    #[arg(long, env = "QRAUTH_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Request a QR challenge and wait until it is authorized.
    Login(LoginArgs),
    /// Check a polling token once.
    Status { polling_token: String },
    /// Print the profile of the logged-in user.
    Whoami,
    /// Revoke the token on the server and forget it locally.
    Logout,
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[arg(long, default_value_t = 2000)]
    interval_ms: u64,

    #[arg(long, default_value_t = 150)]
    max_polls: u32,
}

/// Terminal stand-in for a browser redirect.
struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn redirect(&self, route: &str) {
        eprintln!("session expired ({route}); run `qrauth login` to sign in again");
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env()?;
    if let Some(base_url) = &cli.base_url {
        config = config.with_base_url(base_url);
    }
    let token_path = cli
        .token_file
        .clone()
        .unwrap_or_else(|| default_token_path(std::env::var("HOME").ok().as_deref(), &config.token_key));
    let tokens = Arc::new(FileTokenStore::new(token_path));
    tracing::debug!(base_url = %config.base_url, token_file = %tokens.path().display(), "cli configured");

    let session = Arc::new(SessionStore::new(tokens.clone()));
    let transport = Arc::new(HttpTransport::new(config.timeout)?);
    let client = ApiClient::new(transport, session, Arc::new(TerminalNavigator), &config);
    let auth = AuthService::new(client, config.endpoints.clone());

    match cli.command {
        Command::Login(args) => run_login(&auth, args).await,
        Command::Status { polling_token } => {
            println!("{}", auth.poll_status(&polling_token).await);
            Ok(())
        }
        Command::Whoami => run_whoami(&auth, tokens.as_ref()).await,
        Command::Logout => {
            auth.logout().await;
            println!("logged out");
            Ok(())
        }
    }
}

async fn run_login(auth: &AuthService, args: LoginArgs) -> Result<(), CliError> {
    let challenge = auth.request_challenge().await?;
    print_challenge(&challenge)?;

    let interval = Duration::from_millis(args.interval_ms);
    let profile = wait_for_login(auth, &challenge.temp_token, interval, args.max_polls).await?;
    println!("logged in as {}", profile.display_name().unwrap_or("user"));
    Ok(())
}

/// Poll until the challenge is authorized, then load the profile.
///
/// Failed checks keep polling and count toward `max_polls`.
async fn wait_for_login(
    auth: &AuthService,
    polling_token: &str,
    interval: Duration,
    max_polls: u32,
) -> Result<UserProfile, CliError> {
    let mut last = LoginStatus::Pending;
    for attempt in 1..=max_polls {
        tokio::time::sleep(interval).await;
        match auth.poll_status(polling_token).await {
            LoginStatus::Authorized => return Ok(auth.fetch_profile().await?),
            LoginStatus::Expired => return Err(CliError::ChallengeExpired),
            LoginStatus::Error => eprintln!("status check failed (attempt {attempt}/{max_polls})"),
            other => {
                if other != last {
                    eprintln!("status: {other}");
                }
                last = other;
            }
        }
    }
    Err(CliError::PollLimit(max_polls))
}

async fn run_whoami(auth: &AuthService, tokens: &dyn TokenStore) -> Result<(), CliError> {
    if tokens.get().is_none() {
        return Err(CliError::NotLoggedIn);
    }
    let profile = auth.fetch_profile().await?;
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}

fn print_challenge(challenge: &QrChallenge) -> Result<(), CliError> {
    match challenge.scan_url() {
        Some(url) => println!("scan or open to log in: {url}"),
        None => println!("{}", serde_json::to_string_pretty(challenge)?),
    }
    if let Some(secs) = challenge.expires_in() {
        println!("challenge expires in {secs}s");
    }
    Ok(())
}

/// `$HOME/.qrauth/<key>`, or `./.qrauth/<key>` when `HOME` is unset.
fn default_token_path(home: Option<&str>, token_key: &str) -> PathBuf {
    let root = home.filter(|h| !h.is_empty()).map_or_else(|| PathBuf::from("."), PathBuf::from);
    root.join(".qrauth").join(token_key)
}
