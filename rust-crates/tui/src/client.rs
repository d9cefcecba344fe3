use crate::{
    preferences::SessionPreferences,
    ui,
};
use alloy::primitives::{
    Address,
    U256,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use deployments::{
    DeploymentEnv,
    DeploymentRecord,
    DeploymentStore,
};
use futures::{
    FutureExt,
    future::{
        self,
        BoxFuture,
    },
};
use generated_abi::abi_fingerprint;
use lottery_client::{
    AppController,
    LotteryContract,
    POLL_INTERVAL,
    PurchaseReceipt,
    SessionManager,
    TicketPricing,
    WalletError,
    chain::ChainClient,
    controller::ControllerChannels,
    session::{
        NO_WALLET_MESSAGE,
        WalletProvider,
    },
    wallets::KeystoreWallet,
};
use std::{
    path::PathBuf,
    sync::Arc,
};
use tracing::{
    info,
    warn,
};

pub const DEFAULT_POLYGON_RPC_URL: &str = "https://polygon-rpc.com";
pub const DEFAULT_AMOY_RPC_URL: &str = "https://rpc-amoy.polygon.technology";
pub const DEFAULT_LOCAL_RPC_URL: &str = "http://localhost:8545";

pub fn default_rpc_url(env: DeploymentEnv) -> &'static str {
    match env {
        DeploymentEnv::Polygon => DEFAULT_POLYGON_RPC_URL,
        DeploymentEnv::Amoy => DEFAULT_AMOY_RPC_URL,
        DeploymentEnv::Local => DEFAULT_LOCAL_RPC_URL,
    }
}

#[derive(Clone, Debug)]
pub struct NetworkTarget {
    pub env: DeploymentEnv,
    pub url: String,
}

#[derive(Clone, Debug)]
pub struct WalletConfig {
    /// Profile to start on; the first keystore in `dir` otherwise.
    pub name: Option<String>,
    pub dir: PathBuf,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub network: NetworkTarget,
    pub contract: Option<Address>,
    pub ticket_price: Option<U256>,
    pub wallet: Option<WalletConfig>,
    pub log_dir: PathBuf,
}

/// Where the contract lives and how its ticket price is found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDeployment {
    pub address: Address,
    pub pricing: TicketPricing,
    pub chain_id: Option<u64>,
}

pub fn resolve_deployment(
    config: &AppConfig,
    store: &DeploymentStore,
) -> Result<ResolvedDeployment> {
    let fixed_price = config.ticket_price.map(TicketPricing::Fixed);
    if let Some(address) = config.contract {
        return Ok(ResolvedDeployment {
            address,
            pricing: fixed_price.unwrap_or(TicketPricing::OnChain),
            chain_id: None,
        });
    }

    let env = config.network.env;
    let current_hash = abi_fingerprint();
    let record = store
        .load()
        .map_err(|e| eyre!(e))
        .wrap_err_with(|| format!("Failed to load deployment record for {env}"))?;
    let record = match record {
        Some(record) if record.is_compatible_with_hash(&current_hash) => record,
        other => {
            let summary = format_deployment_summary(
                env,
                &config.network.url,
                store,
                other.as_ref(),
                &current_hash,
            );
            return Err(eyre!(summary));
        }
    };

    let address = record.contract_address.parse::<Address>().map_err(|err| {
        eyre!(
            "Deployment record for {env} has an invalid contract address {}: {err}",
            record.contract_address
        )
    })?;
    let recorded_price = record
        .ticket_price_wei
        .as_deref()
        .map(|raw| {
            raw.parse::<U256>()
                .map(TicketPricing::Fixed)
                .map_err(|err| eyre!("Deployment record has an invalid ticket price {raw}: {err}"))
        })
        .transpose()?;
    Ok(ResolvedDeployment {
        address,
        pricing: fixed_price
            .or(recorded_price)
            .unwrap_or(TicketPricing::OnChain),
        chain_id: Some(record.chain_id),
    })
}

fn format_deployment_summary(
    env: DeploymentEnv,
    url: &str,
    store: &DeploymentStore,
    record: Option<&DeploymentRecord>,
    current_hash: &str,
) -> String {
    let mut message = format!(
        "No compatible deployment recorded for {env} at {url}.\n\nRecorded deployment for {env}:",
    );

    match record {
        Some(record) => {
            let price = record
                .ticket_price_wei
                .as_deref()
                .unwrap_or("(read from contract)");
            message.push_str(&format!(
                "\n  {} on chain {} (abi {}, ticket price {}, deployed {})",
                record.contract_address,
                record.chain_id,
                hash_preview(&record.abi_hash),
                price,
                record.deployed_at,
            ));
        }
        None => message.push_str("\n  (none recorded)"),
    }

    message.push_str(&format!(
        "\n\nCurrent ABI hash: {}",
        hash_preview(current_hash)
    ));
    message.push_str(&format!(
        "\nDeployment records file: {}",
        store.path().display()
    ));
    message.push_str("\n\nPass --contract to use a deployment that is not recorded here.");
    message
}

fn hash_preview(hash: &str) -> String {
    let preview: String = hash.chars().take(16).collect();
    if hash.chars().count() > 16 {
        format!("{preview}...")
    } else {
        preview
    }
}

fn open_wallet(
    chain: &ChainClient,
    config: Option<&WalletConfig>,
) -> Result<Option<Arc<KeystoreWallet>>> {
    let Some(config) = config else {
        info!("no wallet configured");
        return Ok(None);
    };
    match KeystoreWallet::open(chain.clone(), &config.dir, config.name.as_deref()) {
        Ok(wallet) => Ok(Some(Arc::new(wallet))),
        Err(WalletError::Unavailable) => {
            warn!(dir = %config.dir.display(), "no keystores found; running read-only");
            Ok(None)
        }
        Err(err) => Err(err).wrap_err("Failed to open wallet"),
    }
}

pub async fn run_app(config: AppConfig) -> Result<()> {
    let env = config.network.env;
    let store = DeploymentStore::new(env).map_err(|e| eyre!(e))?;
    let deployment = resolve_deployment(&config, &store)?;
    let chain = ChainClient::connect(&config.network.url)?;
    match (chain.chain_id().await, deployment.chain_id) {
        (Ok(actual), Some(recorded)) if actual != recorded => {
            warn!(actual, recorded, "node chain id differs from the deployment record");
        }
        (Ok(_), _) => {}
        (Err(err), _) => warn!(error = %err, "could not read chain id"),
    }
    info!(
        network = %env,
        contract = %deployment.address,
        pricing = ?deployment.pricing,
        "lottery deployment resolved"
    );

    let lottery = chain.lottery(deployment.address);
    let contract = LotteryContract::new(
        deployment.address,
        Arc::new(lottery.clone()),
        deployment.pricing,
    );
    let wallet = open_wallet(&chain, config.wallet.as_ref())?;
    let provider = wallet
        .clone()
        .map(|wallet| wallet as Arc<dyn WalletProvider>);
    let (mut controller, channels) = AppController::new(
        SessionManager::new(provider),
        contract,
        Arc::new(lottery),
        POLL_INTERVAL,
    );
    controller.start().await;

    let mut preferences = SessionPreferences::new();
    let mut ui_state = ui::UiState::new(env, preferences.lucky_phrase());
    let mut input_events = ui::InputEvents::spawn();

    tracing::info!("Starting UI");
    ui::terminal_enter(&mut ui_state)?;
    let res = run_loop(
        &mut controller,
        channels,
        wallet.as_deref(),
        &mut ui_state,
        &mut input_events,
    )
    .await;
    controller.shutdown();
    ui::terminal_exit()?;
    res
}

type Confirmation = BoxFuture<'static, lottery_client::Result<PurchaseReceipt>>;

async fn await_confirmation(
    confirmation: &mut Option<Confirmation>,
) -> lottery_client::Result<PurchaseReceipt> {
    match confirmation {
        Some(pending) => pending.await,
        None => future::pending().await,
    }
}

async fn run_loop(
    controller: &mut AppController,
    mut channels: ControllerChannels,
    wallet: Option<&KeystoreWallet>,
    ui_state: &mut ui::UiState,
    input_events: &mut ui::InputEvents,
) -> Result<()> {
    tracing::info!("Running app loop");
    let mut sessions = controller.session_reader();
    let mut confirmation: Option<Confirmation> = None;
    ui::draw(ui_state, &controller.view()).wrap_err("initial draw failed")?;

    loop {
        tokio::select! {
            Some(event) = channels.sync_rx.recv() => {
                controller.ingest_sync_event(event);
                controller.reattach_feed_if_needed().await;
            }
            Some(event) = channels.feed_rx.recv() => controller.ingest_feed_event(event),
            changed = sessions.changed() => {
                if changed.is_err() {
                    warn!("session channel closed");
                    break;
                }
                controller.on_session_changed();
            }
            outcome = await_confirmation(&mut confirmation), if confirmation.is_some() => {
                confirmation = None;
                let _ = controller.finish_purchase(outcome);
            }
            _ = tokio::signal::ctrl_c() => break,
            raw_ev = input_events.recv() => {
                let Some(raw_ev) = raw_ev else {
                    warn!("input reader stopped");
                    break;
                };
                let Some(ev) = ui::interpret_event(ui_state, raw_ev?) else {
                    continue;
                };
                match ev {
                    ui::UserEvent::Quit => break,
                    ui::UserEvent::Redraw => {}
                    ui::UserEvent::Connect => {
                        let prompts = wallet.is_some_and(|wallet| !wallet.is_unlocked());
                        if prompts {
                            input_events.pause();
                            ui::terminal_exit()?;
                        }
                        let result = controller.connect().await;
                        if prompts {
                            ui::terminal_enter(ui_state)?;
                            input_events.resume();
                        }
                        if let Err(err) = result {
                            warn!(error = %err, "wallet connection failed");
                        }
                    }
                    ui::UserEvent::Disconnect => controller.disconnect(),
                    ui::UserEvent::Buy | ui::UserEvent::Lucky => {
                        if controller.is_purchase_pending() {
                            controller.set_status("A purchase is already waiting for confirmation");
                        } else if let Ok(pending) = controller.submit_purchase().await {
                            ui::draw(ui_state, &controller.view())
                                .wrap_err("draw after purchase submission failed")?;
                            confirmation = Some(pending.confirmed().boxed());
                        }
                    }
                    ui::UserEvent::SwitchWallet => match wallet {
                        Some(wallet) if wallet.profile_count() > 1 => {
                            let next = wallet.select_next_profile();
                            controller.set_status(format!(
                                "Wallet profile {} selected; press c to connect",
                                next.name
                            ));
                        }
                        Some(_) => controller.set_status("Only one wallet profile available"),
                        None => controller.set_status(NO_WALLET_MESSAGE),
                    },
                    ui::UserEvent::Refresh => {
                        if !controller.refresh() {
                            warn!("refresh requested while synchronizer is stopped");
                        }
                    }
                }
            }
        }
        ui::draw(ui_state, &controller.view()).wrap_err("draw failed")?;
    }
    Ok(())
}
