use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Management CLI for the crank gateway admin API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "GATEWAY_ADMIN_KEY", default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Gateway status: routes and idle sockets
    Status,
    /// Registered connectors grouped by route and component
    Connectors,
    /// List dark hosts
    DarkHosts,
    /// Put a host into dark mode
    DarkEnable { host: String },
    /// Take a host out of dark mode
    DarkDisable { host: String },
    /// Take every host out of dark mode
    DarkClear,
}

impl Commands {
    fn request(&self) -> (Method, String) {
        match self {
            Commands::Status => (Method::GET, "/admin/status".to_string()),
            Commands::Connectors => (Method::GET, "/admin/connectors".to_string()),
            Commands::DarkHosts => (Method::GET, "/admin/dark-hosts".to_string()),
            Commands::DarkEnable { host } => (Method::PUT, format!("/admin/dark-hosts/{host}")),
            Commands::DarkDisable { host } => (Method::DELETE, format!("/admin/dark-hosts/{host}")),
            Commands::DarkClear => (Method::DELETE, "/admin/dark-hosts".to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let (method, path) = cli.command.request();
    let res = client
        .request(method, format!("{}{}", cli.url.trim_end_matches('/'), path))
        .headers(headers)
        .send()
        .await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
