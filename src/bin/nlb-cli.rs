use clap::{Parser, Subcommand, ValueEnum};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "nlb-cli")]
#[command(about = "Management CLI for the protocol-aware network load balancer", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8082")]
    url: String,

    /// Admin API key. Falls back to NLB_ADMIN_API_KEY.
    #[arg(short, long, env = "NLB_ADMIN_API_KEY", default_value = "")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Color {
    Blue,
    Green,
}

impl Color {
    fn as_str(self) -> &'static str {
        match self {
            Color::Blue => "blue",
            Color::Green => "green",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Full balancer status
    Status,
    /// Registry stats, optionally with module details
    Stats {
        #[arg(long)]
        modules: bool,
    },
    /// Register a module
    Register {
        name: String,
        protocol: String,
        address: String,
        port: u16,
        #[arg(long, default_value = "")]
        version: String,
        #[arg(long, default_value_t = 0)]
        max_conns: u32,
    },
    /// Unregister a module
    Unregister { protocol: String, name: String },
    /// Mark a module healthy or unhealthy
    Health {
        name: String,
        #[arg(long)]
        unhealthy: bool,
    },
    /// Show a protocol's deployment
    Deployment { protocol: String },
    /// Set a color's version, creating the deployment if needed
    Init {
        protocol: String,
        version: String,
        #[arg(long, value_enum, default_value_t = Color::Blue)]
        color: Color,
    },
    /// Start a stepped canary rollout
    Canary {
        protocol: String,
        version: String,
        #[arg(long, value_enum)]
        target: Color,
        #[arg(long)]
        step_size: Option<u32>,
        #[arg(long)]
        step_duration_secs: Option<u64>,
    },
    /// Move all traffic to one color now
    Switch {
        protocol: String,
        #[arg(long, value_enum)]
        target: Color,
    },
    /// Roll a deployment back
    Rollback { protocol: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut headers = HeaderMap::new();
    if !cli.key.is_empty() {
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
        );
    }
    let client = reqwest::Client::builder().default_headers(headers).build()?;
    let base = cli.url.trim_end_matches('/');

    let res = match cli.command {
        Commands::Status => client.get(format!("{base}/status")).send().await?,
        Commands::Stats { modules } => {
            client
                .get(format!("{base}/v1/stats"))
                .query(&[("include_modules", modules), ("include_metrics", true)])
                .send()
                .await?
        }
        Commands::Register {
            name,
            protocol,
            address,
            port,
            version,
            max_conns,
        } => {
            client
                .post(format!("{base}/v1/modules"))
                .json(&json!({
                    "module_name": name,
                    "protocol": protocol,
                    "address": address,
                    "port": port,
                    "version": version,
                    "max_conns": max_conns,
                }))
                .send()
                .await?
        }
        Commands::Unregister { protocol, name } => {
            client
                .delete(format!("{base}/v1/modules/{protocol}/{name}"))
                .send()
                .await?
        }
        Commands::Health { name, unhealthy } => {
            client
                .post(format!("{base}/v1/health/{name}"))
                .json(&json!({ "healthy": !unhealthy }))
                .send()
                .await?
        }
        Commands::Deployment { protocol } => {
            client
                .get(format!("{base}/v1/deployments/{protocol}"))
                .send()
                .await?
        }
        Commands::Init {
            protocol,
            version,
            color,
        } => {
            client
                .post(format!("{base}/v1/deployments/{protocol}/init"))
                .json(&json!({ "version": version, "color": color.as_str() }))
                .send()
                .await?
        }
        Commands::Canary {
            protocol,
            version,
            target,
            step_size,
            step_duration_secs,
        } => {
            client
                .post(format!("{base}/v1/deployments/{protocol}/canary"))
                .json(&json!({
                    "version": version,
                    "target": target.as_str(),
                    "step_size": step_size,
                    "step_duration_secs": step_duration_secs,
                }))
                .send()
                .await?
        }
        Commands::Switch { protocol, target } => {
            client
                .post(format!("{base}/v1/deployments/{protocol}/switch"))
                .json(&json!({ "target": target.as_str() }))
                .send()
                .await?
        }
        Commands::Rollback { protocol } => {
            client
                .post(format!("{base}/v1/deployments/{protocol}/rollback"))
                .send()
                .await?
        }
    };

    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;

    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if !text.is_empty() {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", text),
    }
    Ok(())
}
