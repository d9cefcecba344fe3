use alloy::primitives::Address;
use clap::{
    ArgGroup,
    Parser,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use deployments::DeploymentEnv;
use lottery_client::wallets;
use std::path::{
    Path,
    PathBuf,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

mod client;
mod preferences;
mod ui;

#[derive(Debug, Parser)]
#[command(
    name = "lottery",
    about = "Terminal client for the on-chain lottery",
    group(ArgGroup::new("network").args(["polygon", "amoy", "local"]).required(true))
)]
struct Cli {
    /// Connect to Polygon mainnet
    #[arg(long)]
    polygon: bool,
    /// Connect to the Amoy testnet
    #[arg(long)]
    amoy: bool,
    /// Connect to a local node
    #[arg(long)]
    local: bool,
    /// Override the RPC URL for the selected network
    #[arg(long, env = "LOTTERY_RPC_URL")]
    rpc_url: Option<String>,
    /// Use this contract instead of the recorded deployment
    #[arg(long, env = "LOTTERY_CONTRACT_ADDRESS")]
    contract: Option<String>,
    /// Keystore profile to sign with; omit for read-only mode
    #[arg(long)]
    wallet: Option<String>,
    /// Keystore directory (defaults to ~/.lottery/wallets)
    #[arg(long)]
    wallet_dir: Option<String>,
    /// Fixed ticket price in whole native units, for contracts without ticketPrice()
    #[arg(long)]
    ticket_price: Option<String>,
    /// Where the rolling log file goes
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

impl Cli {
    fn network(&self) -> Result<client::NetworkTarget> {
        let env = match (self.polygon, self.amoy, self.local) {
            (true, false, false) => DeploymentEnv::Polygon,
            (false, true, false) => DeploymentEnv::Amoy,
            (false, false, true) => DeploymentEnv::Local,
            _ => {
                return Err(eyre!(
                    "Select exactly one network with --polygon, --amoy, or --local"
                ));
            }
        };
        let url = self
            .rpc_url
            .clone()
            .unwrap_or_else(|| client::default_rpc_url(env).to_string());
        Ok(client::NetworkTarget { env, url })
    }

    fn into_config(self) -> Result<client::AppConfig> {
        let network = self.network()?;
        let contract = self
            .contract
            .as_deref()
            .map(|raw| {
                raw.parse::<Address>()
                    .map_err(|err| eyre!("Invalid --contract address {raw}: {err}"))
            })
            .transpose()?;
        let ticket_price = self
            .ticket_price
            .as_deref()
            .map(|raw| {
                alloy::primitives::utils::parse_ether(raw)
                    .map_err(|err| eyre!("Invalid --ticket-price {raw}: {err}"))
            })
            .transpose()?;
        let wallet = match (self.wallet, self.wallet_dir) {
            (None, None) => None,
            (name, dir) => Some(client::WalletConfig {
                name,
                dir: wallets::resolve_wallet_dir(dir.as_deref())?,
            }),
        };
        Ok(client::AppConfig {
            network,
            contract,
            ticket_price,
            wallet,
            log_dir: self.log_dir,
        })
    }
}

fn init_tracing(log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .wrap_err_with(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::daily(log_dir, "lottery.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|err| eyre!("Failed to install tracing subscriber: {err}"))?;
    Ok(guard)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let app_config = Cli::parse().into_config()?;
    let _log_guard = init_tracing(&app_config.log_dir)?;
    tracing::info!("starting lottery client");
    deployments::ensure_structure().map_err(|e| eyre!(e))?;
    client::run_app(app_config).await
}
