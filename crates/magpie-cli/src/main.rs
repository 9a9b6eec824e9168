use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "magpie", version, about = "Technology-transfer listing aggregator")]
struct Cli {
    /// Base URL of the Magpie server
    #[arg(
        long,
        global = true,
        env = "MAGPIE_SERVER_URL",
        default_value = "http://localhost:3000"
    )]
    server: String,

    /// Admin API token
    #[arg(long, global = true, env = "MAGPIE_ADMIN_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a scrape job
    Submit {
        /// Listing page to scrape (https only)
        #[arg(short, long)]
        url: String,

        /// Institution class (us_university, international_university,
        /// federal_lab, research_institute)
        #[arg(short, long)]
        institution: String,

        /// Rate-limit this institution under its own key instead of the
        /// class-wide one
        #[arg(long)]
        instance_key: Option<String>,

        /// Path to a JSON file with the selector configuration
        #[arg(short, long)]
        selector: PathBuf,

        /// Override the retry attempt budget
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Show a job's current status
    Status {
        #[arg(short, long)]
        id: Uuid,
    },

    /// Page through a job's extracted records
    Results {
        #[arg(short, long)]
        id: Uuid,

        #[arg(short, long, default_value_t = 1)]
        page: u32,

        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// Request cancellation of a job
    Cancel {
        #[arg(short, long)]
        id: Uuid,
    },

    /// Show aggregate pipeline metrics
    Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let api = ApiClient::new(&cli.server, cli.token.as_deref())?;

    match cli.command {
        Commands::Submit {
            url,
            institution,
            instance_key,
            selector,
            max_attempts,
        } => {
            let selector: serde_json::Value = serde_json::from_str(
                &std::fs::read_to_string(&selector)
                    .with_context(|| format!("reading selector file {}", selector.display()))?,
            )
            .context("selector file is not valid JSON")?;

            let mut body = serde_json::json!({
                "url": url,
                "institution": institution,
                "selector": selector,
            });
            if let Some(key) = instance_key {
                body["instance_key"] = key.into();
            }
            if let Some(max) = max_attempts {
                body["retry"] = serde_json::json!({ "max_attempts": max });
            }

            let response = api.post("/scraper/jobs", &body).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Status { id } => {
            let response = api.get(&format!("/scraper/jobs/{id}/status")).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Results { id, page, limit } => {
            let response = api
                .get(&format!(
                    "/scraper/jobs/{id}/results?page={page}&limit={limit}"
                ))
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Cancel { id } => {
            let response = api.delete(&format!("/scraper/jobs/{id}")).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Metrics => {
            let response = api.get("/scraper/metrics").await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}

/// Thin JSON client for the Magpie server.
struct ApiClient {
    base: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl ApiClient {
    fn new(base: &str, token: Option<&str>) -> Result<Self> {
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            token: token.map(str::to_string),
            client: reqwest::Client::builder()
                .user_agent("magpie-cli/0.1")
                .build()?,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, format!("{}{path}", self.base));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<serde_json::Value> {
        let response = builder.send().await.context("request failed")?;
        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .unwrap_or_else(|_| serde_json::json!({}));

        if !status.is_success() {
            bail!(
                "server returned {status}: {}",
                serde_json::to_string_pretty(&body)?
            );
        }
        Ok(body)
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value> {
        self.send(self.request(reqwest::Method::GET, path)).await
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        self.send(self.request(reqwest::Method::POST, path).json(body))
            .await
    }

    async fn delete(&self, path: &str) -> Result<serde_json::Value> {
        self.send(self.request(reqwest::Method::DELETE, path)).await
    }
}
