use crate::{
    chain::ChainClient,
    contract::PurchaseSigner,
    error::WalletError,
    session::{
        ProviderNotification,
        WalletProvider,
    },
};
use alloy::{
    primitives::Address,
    signers::local::PrivateKeySigner,
};
use eth_keystore::decrypt_key;
use futures::{
    FutureExt,
    StreamExt,
    future::{
        self,
        BoxFuture,
    },
    stream::{
        self,
        BoxStream,
    },
};
use std::{
    collections::HashMap,
    fs,
    io,
    path::{
        Path,
        PathBuf,
    },
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{
    debug,
    info,
    warn,
};

pub const CHAIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalletDescriptor {
    pub name: String,
    pub path: PathBuf,
}

impl WalletDescriptor {
    pub fn new(name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            path,
        }
    }
}

pub fn default_wallet_dir() -> Result<PathBuf, WalletError> {
    let home = std::env::var("HOME")
        .map_err(|_| WalletError::Failed("HOME environment variable not set".to_string()))?;
    Ok(PathBuf::from(home).join(".lottery").join("wallets"))
}

pub fn resolve_wallet_dir(dir: Option<&str>) -> Result<PathBuf, WalletError> {
    match dir {
        Some(raw) => {
            let expanded = shellexpand::tilde(raw);
            Ok(PathBuf::from(expanded.into_owned()))
        }
        None => default_wallet_dir(),
    }
}

/// Keystore files in `dir`, sorted by name. Both `.wallet` and `.json`
/// extensions are accepted.
pub fn list_wallets(dir: &Path) -> Result<Vec<WalletDescriptor>, WalletError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let read_failed =
        |err: io::Error| WalletError::Failed(format!("Failed to read wallet directory: {err}"));
    let mut wallets = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_failed)? {
        let path = entry.map_err(read_failed)?.path();
        if !path.is_file() {
            continue;
        }
        let extension = path.extension().and_then(|ext| ext.to_str());
        if !matches!(extension, Some("wallet") | Some("json")) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
            warn!(?path, "skipping wallet with non-UTF-8 name");
            continue;
        };
        wallets.push(WalletDescriptor::new(name, path.clone()));
    }
    wallets.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(wallets)
}

pub fn find_wallet(dir: &Path, name: &str) -> Result<WalletDescriptor, WalletError> {
    list_wallets(dir)?
        .into_iter()
        .find(|w| w.name == name)
        .ok_or_else(|| {
            WalletError::Failed(format!(
                "Wallet '{name}' not found in {}",
                dir.to_string_lossy()
            ))
        })
}

pub type PasswordPrompt = Arc<dyn Fn(&str) -> io::Result<String> + Send + Sync>;

fn terminal_prompt() -> PasswordPrompt {
    Arc::new(|prompt: &str| rpassword::prompt_password(prompt))
}

struct Profiles {
    all: Vec<WalletDescriptor>,
    active: usize,
}

/// Wallet provider backed by a directory of encrypted keystores.
///
/// Access is granted by unlocking the active profile with its password.
/// Unlocked keys stay in memory for the life of the process, the way a
/// browser wallet remembers that a site is authorized.
pub struct KeystoreWallet {
    chain: ChainClient,
    profiles: Mutex<Profiles>,
    unlocked: Mutex<HashMap<PathBuf, PrivateKeySigner>>,
    last_chain_id: Mutex<Option<u64>>,
    notifications: broadcast::Sender<ProviderNotification>,
    chain_poll: Duration,
    prompt: PasswordPrompt,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl KeystoreWallet {
    /// Opens `dir`, starting on the profile named `preferred` if given.
    pub fn open(
        chain: ChainClient,
        dir: &Path,
        preferred: Option<&str>,
    ) -> Result<Self, WalletError> {
        let all = list_wallets(dir)?;
        if all.is_empty() {
            return Err(WalletError::Unavailable);
        }
        let active = match preferred {
            Some(name) => {
                let wanted = find_wallet(dir, name)?;
                all.iter().position(|w| *w == wanted).unwrap_or(0)
            }
            None => 0,
        };
        info!(
            dir = %dir.display(),
            profiles = all.len(),
            active = %all[active].name,
            "keystore wallet opened"
        );
        let (notifications, _) = broadcast::channel(16);
        Ok(Self {
            chain,
            profiles: Mutex::new(Profiles { all, active }),
            unlocked: Mutex::new(HashMap::new()),
            last_chain_id: Mutex::new(None),
            notifications,
            chain_poll: CHAIN_POLL_INTERVAL,
            prompt: terminal_prompt(),
        })
    }

    pub fn with_prompt(mut self, prompt: PasswordPrompt) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_chain_poll(mut self, interval: Duration) -> Self {
        self.chain_poll = interval;
        self
    }

    pub fn active_profile(&self) -> WalletDescriptor {
        let profiles = lock(&self.profiles);
        profiles.all[profiles.active].clone()
    }

    pub fn profile_count(&self) -> usize {
        lock(&self.profiles).all.len()
    }

    /// Whether the active profile can connect without a password prompt.
    pub fn is_unlocked(&self) -> bool {
        let path = self.active_profile().path;
        lock(&self.unlocked).contains_key(&path)
    }

    /// Move to the next profile. Subscribers see the current account go away.
    pub fn select_next_profile(&self) -> WalletDescriptor {
        let next = {
            let mut profiles = lock(&self.profiles);
            profiles.active = (profiles.active + 1) % profiles.all.len();
            profiles.all[profiles.active].clone()
        };
        info!(profile = %next.name, "wallet profile switched");
        let _ = self
            .notifications
            .send(ProviderNotification::AccountsChanged(Vec::new()));
        next
    }

    async fn unlock(&self, descriptor: WalletDescriptor) -> Result<Address, WalletError> {
        let cached = lock(&self.unlocked)
            .get(&descriptor.path)
            .map(PrivateKeySigner::address);
        if let Some(address) = cached {
            return Ok(address);
        }

        let prompt = Arc::clone(&self.prompt);
        let label = format!("Enter password for wallet '{}': ", descriptor.name);
        let password = tokio::task::spawn_blocking(move || prompt(&label))
            .await
            .map_err(|err| WalletError::Failed(err.to_string()))?
            .map_err(|err| {
                debug!(error = %err, "password prompt aborted");
                WalletError::Rejected
            })?;
        if password.is_empty() {
            return Err(WalletError::Rejected);
        }

        let path = descriptor.path.clone();
        let secret = tokio::task::spawn_blocking(move || decrypt_key(&path, password.as_bytes()))
            .await
            .map_err(|err| WalletError::Failed(err.to_string()))?
            .map_err(|_| {
                WalletError::Failed(format!("Invalid password for wallet '{}'", descriptor.name))
            })?;
        let key = PrivateKeySigner::from_slice(&secret).map_err(|_| {
            WalletError::Failed(format!(
                "Wallet '{}' contained unsupported key material",
                descriptor.name
            ))
        })?;

        let address = key.address();
        lock(&self.unlocked).insert(descriptor.path, key);
        info!(%address, "wallet unlocked");
        Ok(address)
    }

    fn chain_changes(&self) -> BoxStream<'static, ProviderNotification> {
        let chain = self.chain.clone();
        let period = self.chain_poll;
        let seed = *lock(&self.last_chain_id);
        stream::unfold((chain, seed), move |(chain, mut last)| async move {
            loop {
                tokio::time::sleep(period).await;
                match chain.chain_id().await {
                    Ok(current) => match last {
                        Some(previous) if previous != current => {
                            return Some((
                                ProviderNotification::ChainChanged(current),
                                (chain, Some(current)),
                            ));
                        }
                        _ => last = Some(current),
                    },
                    Err(err) => debug!(error = %err, "chain id poll failed"),
                }
            }
        })
        .boxed()
    }
}

impl WalletProvider for KeystoreWallet {
    fn request_accounts(&self) -> BoxFuture<'_, Result<Vec<Address>, WalletError>> {
        async move {
            let descriptor = self.active_profile();
            let address = self.unlock(descriptor).await?;
            Ok(vec![address])
        }
        .boxed()
    }

    fn chain_id(&self) -> BoxFuture<'_, Result<u64, WalletError>> {
        async move {
            let chain_id = self
                .chain
                .chain_id()
                .await
                .map_err(|err| WalletError::Failed(err.to_string()))?;
            *lock(&self.last_chain_id) = Some(chain_id);
            Ok(chain_id)
        }
        .boxed()
    }

    fn signer_for(&self, account: Address) -> Result<Arc<dyn PurchaseSigner>, WalletError> {
        let key = lock(&self.unlocked)
            .values()
            .find(|key| key.address() == account)
            .cloned()
            .ok_or_else(|| WalletError::Failed(format!("{account} is not unlocked")))?;
        Ok(Arc::new(self.chain.signer(key)))
    }

    fn subscribe(&self) -> BoxStream<'static, ProviderNotification> {
        let switches = BroadcastStream::new(self.notifications.subscribe())
            .filter_map(|item| future::ready(item.ok()));
        stream::select(switches, self.chain_changes()).boxed()
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use tempdir::TempDir;

    fn keystore_dir(names: &[&str]) -> TempDir {
        let dir = TempDir::new("wallets").unwrap();
        for name in names {
            fs::write(dir.path().join(name), b"{}").unwrap();
        }
        dir
    }

    fn wallet_in(dir: &TempDir, password: &'static str) -> KeystoreWallet {
        let chain = ChainClient::connect("http://localhost:8545").unwrap();
        KeystoreWallet::open(chain, dir.path(), None)
            .unwrap()
            .with_prompt(Arc::new(move |_: &str| Ok::<_, io::Error>(password.to_string())))
            .with_chain_poll(Duration::from_secs(3600))
    }

    #[test]
    fn list_wallets__returns_keystores_sorted_by_name() {
        // given
        let dir = keystore_dir(&["bob.wallet", "alice.json", "notes.txt"]);

        // when
        let wallets = list_wallets(dir.path()).unwrap();

        // then
        let names: Vec<_> = wallets.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[test]
    fn list_wallets__missing_dir_is_empty() {
        let dir = TempDir::new("wallets").unwrap();

        let wallets = list_wallets(&dir.path().join("absent")).unwrap();

        assert!(wallets.is_empty());
    }

    #[test]
    fn find_wallet__reports_unknown_name() {
        let dir = keystore_dir(&["alice.wallet"]);

        let result = find_wallet(dir.path(), "carol");

        assert!(matches!(result, Err(WalletError::Failed(msg)) if msg.contains("carol")));
    }

    #[test]
    fn resolve_wallet_dir__expands_tilde() {
        let Ok(home) = std::env::var("HOME") else {
            return;
        };

        let resolved = resolve_wallet_dir(Some("~/keys")).unwrap();

        assert_eq!(resolved, PathBuf::from(home).join("keys"));
    }

    #[test]
    fn open__empty_dir_is_unavailable() {
        let dir = keystore_dir(&[]);
        let chain = ChainClient::connect("http://localhost:8545").unwrap();

        let result = KeystoreWallet::open(chain, dir.path(), None);

        assert!(matches!(result, Err(WalletError::Unavailable)));
    }

    #[tokio::test]
    async fn request_accounts__empty_password_is_a_decline() {
        // given
        let dir = keystore_dir(&["alice.wallet"]);
        let wallet = wallet_in(&dir, "");

        // when
        let result = wallet.request_accounts().await;

        // then
        assert_eq!(result, Err(WalletError::Rejected));
        assert!(!wallet.is_unlocked());
    }

    #[tokio::test]
    async fn request_accounts__undecryptable_keystore_fails() {
        // given
        let dir = keystore_dir(&["alice.wallet"]);
        let wallet = wallet_in(&dir, "hunter2");

        // when
        let result = wallet.request_accounts().await;

        // then
        assert!(matches!(result, Err(WalletError::Failed(msg)) if msg.contains("alice")));
    }

    #[tokio::test]
    async fn select_next_profile__cycles_and_notifies() {
        // given
        let dir = keystore_dir(&["alice.wallet", "bob.wallet"]);
        let wallet = wallet_in(&dir, "");
        let mut notifications = wallet.subscribe();

        // when
        let second = wallet.select_next_profile();
        let third = wallet.select_next_profile();

        // then
        assert_eq!(second.name, "bob");
        assert_eq!(third.name, "alice");
        assert_eq!(
            notifications.next().await,
            Some(ProviderNotification::AccountsChanged(Vec::new()))
        );
    }

    #[test]
    fn signer_for__requires_unlocked_account() {
        let dir = keystore_dir(&["alice.wallet"]);
        let wallet = wallet_in(&dir, "");

        let result = wallet.signer_for(Address::repeat_byte(1));

        assert!(matches!(result, Err(WalletError::Failed(_))));
    }
}
