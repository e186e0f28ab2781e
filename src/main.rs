use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flight_fanout::config::DEFAULT_BASE_URL;
use flight_fanout::{
    fetch_all, logging, AmadeusClient, ClientConfig, Credentials, ErrorKind, FanOutConfig,
    FetchOutcome,
};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "flight-fanout", version, about = "Amadeus travel API client")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// API base URL
    #[arg(long, global = true, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Search cheapest destinations from several origins concurrently
    Search {
        /// Origin IATA code; repeat for more origins
        #[arg(short, long = "origin", required = true)]
        origins: Vec<String>,

        /// Price ceiling passed as maxPrice
        #[arg(long, default_value = "300")]
        max_price: String,

        /// Cap on simultaneous searches (unbounded when omitted)
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Reuse one access token across searches
        #[arg(long)]
        cache_token: bool,
    },

    /// Cancel a transfer order
    CancelTransfer {
        order_id: String,
        confirm_nbr: String,
    },

    /// Delete a flight order and print the raw response
    DeleteOrder { flight_order_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Loaded before the logger so RUST_LOG may come from .env
    let dotenv = dotenvy::dotenv();
    logging::init_cli_logger(cli.verbose);
    if let Err(e) = dotenv {
        tracing::debug!("no .env file loaded: {}", e);
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let credentials = Credentials::from_env().context("loading API credentials")?;

    match cli.command {
        Command::Search {
            origins,
            max_price,
            max_concurrency,
            cache_token,
        } => {
            let config = ClientConfig::default()
                .with_base_url(cli.base_url)
                .with_token_cache(cache_token);
            let client = Arc::new(AmadeusClient::new(credentials, &config)?);

            search(client, origins, &max_price, FanOutConfig { max_concurrency }).await
        }
        Command::CancelTransfer {
            order_id,
            confirm_nbr,
        } => {
            let config = ClientConfig::default().with_base_url(cli.base_url);
            let client = AmadeusClient::new(credentials, &config)?;

            let response = client
                .cancel_transfer(&order_id, &confirm_nbr)
                .await
                .with_context(|| format!("cancelling transfer order {}", order_id))?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::DeleteOrder { flight_order_id } => {
            let config = ClientConfig::default().with_base_url(cli.base_url);
            let client = AmadeusClient::new(credentials, &config)?;

            let raw = client
                .delete_flight_order(&flight_order_id)
                .await
                .with_context(|| format!("deleting flight order {}", flight_order_id))?;
            println!("Status: {}", raw.status_text);
            println!("Response Body: {}", raw.body_text());
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn search(
    client: Arc<AmadeusClient>,
    origins: Vec<String>,
    max_price: &str,
    config: FanOutConfig,
) -> Result<ExitCode> {
    let mut fan_out = fetch_all(client, origins, max_price, &config);

    let cancel = fan_out.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling outstanding searches");
            cancel.cancel();
        }
    });

    let mut succeeded = 0;
    let mut failed = 0;
    let mut auth_broken = true;

    while let Some(outcome) = fan_out.recv().await {
        match outcome {
            FetchOutcome::Success { origin, response } => {
                succeeded += 1;
                tracing::info!(origin = %origin, destinations = response.data.len(), "search succeeded");
                println!("{}", serde_json::to_string_pretty(&response)?);
            }
            FetchOutcome::Failure { origin, error } => {
                failed += 1;
                if !matches!(error.kind(), ErrorKind::Auth | ErrorKind::Config) {
                    auth_broken = false;
                }
                tracing::error!(origin = %origin, kind = ?error.kind(), "search failed: {}", error);
            }
        }
    }

    tracing::info!(succeeded, failed, state = ?fan_out.state(), "search finished");

    // Per-origin failures are reported, not fatal; credentials that never work are
    if succeeded == 0 && failed > 0 && auth_broken {
        tracing::error!("every search failed to authenticate");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
