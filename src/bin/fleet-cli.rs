use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "fleet-cli")]
#[command(about = "Operator CLI for the fleet-forge control plane", long_about = None)]
struct Cli {
    #[arg(short, long, env = "FLEET_URL", default_value = "http://127.0.0.1:8090")]
    url: String,

    #[arg(short, long, env = "FLEET_API_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Control plane status
    Status,
    /// List agents with their cached state
    Agents,
    /// Cached state of one agent
    AgentStatus { id: String },
    /// Push artifacts to one agent (default: every format it serves)
    Push {
        id: String,
        #[arg(short, long)]
        format: Vec<String>,
    },
    /// Push artifacts to the whole fleet
    PushAll {
        #[arg(short, long)]
        format: Vec<String>,
        /// Overall deadline in seconds
        #[arg(short, long)]
        deadline: Option<u64>,
    },
    /// Restart the managed service on an agent
    Restart { id: String },
    /// Uninstall an agent and disable it
    Uninstall { id: String },
    /// Toggle remote logging on an agent
    Logging {
        id: String,
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Tail an allowlisted log file on an agent
    Logs {
        id: String,
        path: String,
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: usize,
    },
    /// Truncate an allowlisted log file on an agent
    ClearLog { id: String, path: String },
    /// Install parameters for an existing agent
    Install {
        id: String,
        /// Print as an env file instead of JSON
        #[arg(long)]
        env: bool,
    },
    /// Preview the compiled artifact of a format
    Artifact {
        format: String,
        /// Print only the document body
        #[arg(long)]
        raw: bool,
    },
    /// Replace the overlay of a format with the contents of a file
    Overlay { format: String, file: std::path::PathBuf },
    /// Fetch a subscription now
    Resolve {
        id: String,
        /// Return nodes without storing them
        #[arg(long)]
        preview: bool,
    },
    /// Fetch every enabled subscription
    ResolveAll,
    /// Print the whole model as JSON
    Export {
        /// Mask subscription URLs and agent tokens
        #[arg(long)]
        redact: bool,
    },
    /// Replace the whole model with an exported JSON file
    Import { file: std::path::PathBuf },
    /// Wipe the model
    Reset {
        /// Required; the model is not recoverable afterwards
        #[arg(long)]
        yes: bool,
    },
    /// Create or replace an aggregation from a JSON file
    Aggregation { id: String, file: std::path::PathBuf },
    /// Delete an aggregation and its group references
    RemoveAggregation { id: String },
    /// Nodes an aggregation currently expands to
    PreviewAggregation { id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", cli.key))?);

    let base = cli.url.trim_end_matches('/');
    let get = |path: String| client.get(format!("{}{}", base, path)).headers(headers.clone());
    let post = |path: String| client.post(format!("{}{}", base, path)).headers(headers.clone());

    let request: RequestBuilder = match cli.command {
        Commands::Status => get("/api/status".into()),
        Commands::Agents => get("/api/agents".into()),
        Commands::AgentStatus { id } => get(format!("/api/agents/{}/status", id)),
        Commands::Push { id, format } => post(format!("/api/agents/{}/push", id)).json(&json!({ "formats": format })),
        Commands::PushAll { format, deadline } => post("/api/fleet/push".into()).json(&json!({
            "formats": format,
            "deadline_secs": deadline,
        })),
        Commands::Restart { id } => post(format!("/api/agents/{}/restart", id)),
        Commands::Uninstall { id } => post(format!("/api/agents/{}/uninstall", id)),
        Commands::Logging { id, enabled } => {
            post(format!("/api/agents/{}/logging", id)).json(&json!({ "enabled": enabled }))
        }
        Commands::Logs { id, path, lines } => {
            get(format!("/api/agents/{}/logs", id)).query(&[("path", path), ("lines", lines.to_string())])
        }
        Commands::ClearLog { id, path } => post(format!("/api/agents/{}/logs/clear", id)).json(&json!({ "path": path })),
        Commands::Install { id, env } => {
            let request = get(format!("/api/agents/{}/install", id));
            if env {
                return print_text(request.query(&[("output", "env")]).send().await?).await;
            }
            request
        }
        Commands::Artifact { format, raw } => {
            let res = get(format!("/api/artifacts/{}", format)).send().await?;
            if raw && res.status().is_success() {
                let artifact: Value = res.json().await?;
                print!("{}", artifact["content"].as_str().unwrap_or_default());
                return Ok(());
            }
            return print_response(res).await;
        }
        Commands::Overlay { format, file } => {
            let text = std::fs::read_to_string(&file)?;
            client
                .put(format!("{}/api/overlays/{}", base, format))
                .headers(headers.clone())
                .body(text)
        }
        Commands::Resolve { id, preview } => {
            post(format!("/api/subscriptions/{}/resolve", id)).query(&[("preview", preview)])
        }
        Commands::ResolveAll => post("/api/subscriptions/resolve".into()),
        Commands::Export { redact } => get("/api/model".into()).query(&[("redact", redact)]),
        Commands::Import { file } => {
            let model: Value = serde_json::from_str(&std::fs::read_to_string(&file)?)?;
            client
                .put(format!("{}/api/model", base))
                .headers(headers.clone())
                .json(&model)
        }
        Commands::Reset { yes } => {
            if !yes {
                eprintln!("Error: reset wipes the whole model; pass --yes to confirm");
                std::process::exit(2);
            }
            post("/api/model/reset".into())
        }
        Commands::Aggregation { id, file } => {
            let aggregation: Value = serde_json::from_str(&std::fs::read_to_string(&file)?)?;
            client
                .put(format!("{}/api/aggregations/{}", base, id))
                .headers(headers.clone())
                .json(&aggregation)
        }
        Commands::RemoveAggregation { id } => client
            .delete(format!("{}/api/aggregations/{}", base, id))
            .headers(headers.clone()),
        Commands::PreviewAggregation { id } => get(format!("/api/aggregations/{}/preview", id)),
    };

    print_response(request.send().await?).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn print_text(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    if !status.is_success() {
        eprintln!("Error: admin API returned status {}", status);
        eprintln!("Response: {}", text);
        std::process::exit(1);
    }
    print!("{}", text);
    Ok(())
}
