use anyhow::Result;
use clap::{Parser, Subcommand};
use studio::commands::{handle_create_user, handle_issue_token, handle_migrate, handle_serve};
use studio::config::AppConfig;
use studio::users::UserRole;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(name = "studio")]
#[command(about = "Course bookings and payments for the studio", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API (applies pending migrations first)
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        interface: String,

        #[arg(long, default_value_t = 3000)]
        port: u16,

        /// Keep everything in memory instead of Postgres (development only)
        #[arg(long)]
        in_memory: bool,
    },

    /// Apply pending database migrations and exit
    Migrate,

    /// Register a user identity
    CreateUser {
        #[arg(long)]
        email: String,

        /// admin or client
        #[arg(long, default_value = "client")]
        role: UserRole,
    },

    /// Print a bearer token for an existing user
    IssueToken {
        #[arg(long)]
        user_id: Uuid,
    },
}

fn init_sentry(config: &AppConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = std::env::var("SENTRY_DSN").ok().filter(|dsn| !dsn.is_empty())?;

    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            traces_sample_rate: if config.is_production() { 0.05 } else { 1.0 },
            attach_stacktrace: true,
            ..Default::default()
        },
    )))
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        // error! events become Sentry events, warn! and info! breadcrumbs
        .with(sentry_tracing::layer())
        .try_init()?;
    Ok(())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    // Sentry must be initialized before the runtime starts
    let _sentry = init_sentry(&config);
    init_tracing()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Serve {
                interface,
                port,
                in_memory,
            } => handle_serve(config, interface, port, in_memory).await,
            Commands::Migrate => handle_migrate(&config).await,
            Commands::CreateUser { email, role } => handle_create_user(&config, email, role).await,
            Commands::IssueToken { user_id } => handle_issue_token(&config, user_id).await,
        }
    })
}
