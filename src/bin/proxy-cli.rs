use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "proxy-cli")]
#[command(about = "Management CLI for the OpenWebUI model-server proxy", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8000", env = "OPENWEBUI_PROXY_URL")]
    url: String,

    /// Admin API key, needed for `sessions`, `upstreams` and `status`.
    #[arg(short, long, env = "OPENWEBUI_PROXY_ADMIN_KEY")]
    key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Overall health and per-upstream eligibility
    Health,
    /// Proxy counters
    Metrics,
    /// Admin status summary
    Status,
    /// Live HTTP and WebSocket sessions
    Sessions,
    /// Upstream health detail
    Upstreams,
}

impl Commands {
    fn path(&self) -> &'static str {
        match self {
            Commands::Health => "/health",
            Commands::Metrics => "/metrics",
            Commands::Status => "/admin/status",
            Commands::Sessions => "/admin/sessions",
            Commands::Upstreams => "/admin/upstreams",
        }
    }

    fn is_admin(&self) -> bool {
        self.path().starts_with("/admin/")
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    if cli.command.is_admin() {
        let Some(key) = cli.key.as_deref() else {
            eprintln!("Error: --key (or OPENWEBUI_PROXY_ADMIN_KEY) is required for admin commands");
            std::process::exit(2);
        };
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {key}"))?);
    }

    let url = format!("{}{}", cli.url.trim_end_matches('/'), cli.command.path());
    let res = client.get(url).headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;

    // /health answers 503 with a body worth showing.
    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) if !text.is_empty() => println!("{text}"),
        Err(_) => {}
    }

    if !status.is_success() {
        eprintln!("Error: proxy returned status {status}");
        std::process::exit(1);
    }
    Ok(())
}
