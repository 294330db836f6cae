use clap::Parser;
use tracing_subscriber::EnvFilter;

use patron_mcp_runtime::{McpServer, RuntimeConfig};

#[derive(Parser)]
#[command(
    name = "patron-mcp",
    version,
    about = "Patron MCP server — sponsored-services tools over stdio"
)]
struct Cli {
    /// Backend API base URL
    #[arg(long, env = "PATRON_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Public URL of this server, used in OAuth discovery hints
    #[arg(
        long,
        env = "PATRON_PUBLIC_URL",
        default_value = "http://localhost:8080"
    )]
    public_url: String,

    /// Require verified bearer tokens on session tools
    #[arg(long, env = "PATRON_AUTH_ENABLED")]
    auth_enabled: bool,

    /// OIDC provider domain for bearer verification
    #[arg(long, env = "PATRON_AUTH_DOMAIN")]
    auth_domain: Option<String>,

    /// Expected token audience
    #[arg(long, env = "PATRON_AUTH_AUDIENCE")]
    auth_audience: Option<String>,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // stdout carries protocol frames; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if cli.auth_enabled && cli.auth_domain.is_none() {
        tracing::error!("--auth-domain is required when --auth-enabled is set");
        std::process::exit(2);
    }

    let server = McpServer::new(RuntimeConfig {
        api_url: cli.api_url,
        public_url: cli.public_url,
        auth_enabled: cli.auth_enabled,
        auth_domain: cli.auth_domain,
        auth_audience: cli.auth_audience,
    });

    let code = match server.serve_stdio().await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(error = %err, "MCP server terminated");
            1
        }
    };
    std::process::exit(code);
}
