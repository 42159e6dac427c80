use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance daemon control")]
struct Cli {
    /// Base URL of rollcalld
    #[arg(long, default_value = "http://127.0.0.1:8087")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a camp's embedding index in the recognition engine
    Load {
        #[arg(long)]
        camp: i64,
        /// Reload even if the index is already loaded
        #[arg(long)]
        force: bool,
    },
    /// Release a camp's embedding index
    Unload {
        #[arg(long)]
        camp: i64,
    },
    /// Show a camp's index state
    State {
        #[arg(long)]
        camp: i64,
    },
    /// Show daemon and engine health
    Health,
    /// Post a recognition event from a JSON file to the webhook
    Replay {
        /// File containing the webhook body
        file: PathBuf,
    },
}

impl Commands {
    /// HTTP method and path for this command.
    fn route(&self) -> (reqwest::Method, String) {
        match self {
            Self::Load { camp, force } => (
                reqwest::Method::POST,
                format!("/api/camps/{camp}/index/load?force={force}"),
            ),
            Self::Unload { camp } => (reqwest::Method::POST, format!("/api/camps/{camp}/index/unload")),
            Self::State { camp } => (reqwest::Method::GET, format!("/api/camps/{camp}/index")),
            Self::Health => (reqwest::Method::GET, "/api/health".to_string()),
            Self::Replay { .. } => (
                reqwest::Method::POST,
                "/api/face-recognition/webhook".to_string(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (method, path) = cli.command.route();
    let url = format!("{}{}", cli.url.trim_end_matches('/'), path);

    let client = reqwest::Client::new();
    let mut request = client.request(method, &url);
    if let Commands::Replay { file } = &cli.command {
        let body = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        // Catch obvious mistakes locally; the daemon does full validation.
        serde_json::from_slice::<serde_json::Value>(&body)
            .with_context(|| format!("{} is not valid JSON", file.display()))?;
        request = request
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
    }

    tracing::debug!(%url, "sending request");
    let response = request
        .send()
        .await
        .with_context(|| format!("cannot reach rollcalld at {}", cli.url))?;
    let status = response.status();
    let text = response.text().await?;

    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{text}"),
    }

    if !status.is_success() {
        bail!("rollcalld returned {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_route_carries_force() {
        let cli = Cli::try_parse_from(["rollcall", "load", "--camp", "7", "--force"]).unwrap();
        let (method, path) = cli.command.route();
        assert_eq!(method, reqwest::Method::POST);
        assert_eq!(path, "/api/camps/7/index/load?force=true");
        assert_eq!(cli.url, "http://127.0.0.1:8087");
    }

    #[test]
    fn test_replay_requires_file() {
        assert!(Cli::try_parse_from(["rollcall", "replay"]).is_err());
        let cli = Cli::try_parse_from(["rollcall", "--url", "http://h:1", "replay", "e.json"]).unwrap();
        assert_eq!(cli.command.route().1, "/api/face-recognition/webhook");
        assert_eq!(cli.url, "http://h:1");
    }
}
