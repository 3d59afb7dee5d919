//! The gas fee watcher: a background service that keeps fee estimates fresh
//! while anyone is interested in them.

use {
    crate::{
        estimates::{
            FeePerGas,
            GasFeeEstimates,
            GasFeeState,
            LegacyEstimates,
            StateChange,
            TimeBounds,
        },
        fetch::{
            AccountCompatibility,
            Eip1559EstimateFetching,
            GasPriceQuerying,
            NetworkCompatibility,
        },
        time_bounds,
    },
    anyhow::Context,
    prometheus::{IntCounterVec, IntGauge},
    std::{
        collections::HashSet,
        sync::{Arc, Mutex, RwLock, Weak},
        time::Duration,
    },
    tokio::{sync::watch, task::JoinHandle},
    tokio_stream::wrappers::WatchStream,
    tracing::Instrument,
};

/// The interval between scheduled fee updates unless configured otherwise.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(15_000);

/// Returned when a fetch cycle could produce neither EIP-1559 estimates nor
/// a legacy gas price.
#[derive(Debug, thiserror::Error)]
#[error("failed to estimate gas fees: {0:#}")]
pub struct EstimationUnavailable(#[from] anyhow::Error);

/// Opaque identifier for one subscriber that keeps polling alive.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PollToken(String);

impl PollToken {
    /// Mints a fresh random token.
    fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }
}

impl From<String> for PollToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for PollToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// Everything a [`GasFeeWatcher`] needs at construction.
pub struct WatcherConfig {
    /// How long to wait between scheduled fee update cycles.
    pub update_interval: Duration,
    /// Source of EIP-1559 estimate sets.
    pub fetcher: Arc<dyn Eip1559EstimateFetching>,
    /// Whether the active network supports EIP-1559 estimation.
    pub network: Arc<dyn NetworkCompatibility>,
    /// Whether the selected account can use EIP-1559 fees. `None` means no
    /// restriction.
    pub account: Option<Arc<dyn AccountCompatibility>>,
    /// Handle used for legacy gas price queries. Sending a new handle (on a
    /// network change) replaces the one in use without triggering a fetch.
    pub provider_updates: watch::Receiver<Arc<dyn GasPriceQuerying>>,
    /// State to report until the first fetch completes.
    pub initial_state: GasFeeState,
}

impl WatcherConfig {
    /// Config with the default interval, no account restriction and an empty
    /// initial state. Override individual fields as needed.
    pub fn new(
        fetcher: Arc<dyn Eip1559EstimateFetching>,
        network: Arc<dyn NetworkCompatibility>,
        provider_updates: watch::Receiver<Arc<dyn GasPriceQuerying>>,
    ) -> Self {
        Self {
            update_interval: DEFAULT_UPDATE_INTERVAL,
            fetcher,
            network,
            account: None,
            provider_updates,
            initial_state: GasFeeState::default(),
        }
    }
}

/// Watches the current gas fee landscape: periodically fetches estimates,
/// derives expected confirmation times and publishes every result.
///
/// Polling runs while at least one [`PollToken`] is registered. Estimates
/// fetched on a previous network stay published after a network change until
/// the next cycle replaces them.
///
/// Is an `Arc` internally.
#[derive(Clone)]
pub struct GasFeeWatcher {
    inner: Arc<Inner>,
}

/// A read handle onto the published state: `borrow` answers point queries,
/// `changed` awaits the next update.
pub type StateWatcher = watch::Receiver<StateChange>;

/// Creates a stream that yields the current state once and then every
/// published update. Slow consumers only observe the latest state, never
/// every intermediate one.
pub fn into_stream(watcher: StateWatcher) -> WatchStream<StateChange> {
    WatchStream::new(watcher)
}

impl GasFeeWatcher {
    /// Creates the watcher and spawns its network change listener.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: WatcherConfig) -> Self {
        let mut provider_updates = config.provider_updates;
        let provider = provider_updates.borrow_and_update().clone();
        let (state, _) = watch::channel(StateChange {
            state: config.initial_state,
            diff: Default::default(),
        });
        let inner = Arc::new(Inner {
            update_interval: config.update_interval,
            fetcher: config.fetcher,
            network: config.network,
            account: config.account,
            provider: RwLock::new(provider),
            state,
            update_lock: tokio::sync::Mutex::new(()),
            poll_tokens: Mutex::new(HashSet::new()),
            poller: Mutex::new(None),
            provider_listener: Mutex::new(None),
        });
        let listener = tokio::task::spawn(
            provider_listener(Arc::downgrade(&inner), provider_updates)
                .instrument(tracing::info_span!("gas_fee_provider_listener")),
        );
        *inner.provider_listener.lock().unwrap() = Some(listener);
        Self { inner }
    }

    /// Runs one fetch cycle and returns the resulting state. Does not touch
    /// the poll token set or the timer.
    pub async fn fetch_once(&self) -> Result<GasFeeState, EstimationUnavailable> {
        self.inner.update_once().await
    }

    /// Registers `token` (minting one if absent) as a subscriber that wants
    /// periodic updates and returns the effective token.
    ///
    /// Starting from an empty token set runs one fetch cycle up front so the
    /// caller observes fresh data instead of waiting a full interval. If
    /// that cycle fails the error propagates and nothing gets registered.
    pub async fn start_polling(
        &self,
        token: Option<PollToken>,
    ) -> Result<PollToken, EstimationUnavailable> {
        if self.inner.poll_tokens.lock().unwrap().is_empty() {
            self.inner.update_once().await?;
        }
        let token = token.unwrap_or_else(PollToken::generate);
        register_and_arm(&self.inner, token.clone());
        Ok(token)
    }

    /// Withdraws one subscriber. When the last one leaves, the timer stops
    /// and the published state resets to empty.
    pub fn stop_polling(&self, token: &PollToken) {
        let mut tokens = self.inner.poll_tokens.lock().unwrap();
        tokens.remove(token);
        Metrics::get()
            .gas_fee_poll_tokens
            .set(i64::try_from(tokens.len()).unwrap_or(i64::MAX));
        if tokens.is_empty() {
            self.inner.halt_polling(&mut tokens);
        }
    }

    /// Stops the timer and resets the published state no matter which
    /// subscribers are still registered.
    pub fn stop_all(&self) {
        let mut tokens = self.inner.poll_tokens.lock().unwrap();
        self.inner.halt_polling(&mut tokens);
    }

    /// Permanently shuts the watcher down: stops listening for network
    /// changes, then stops polling and resets the state.
    pub fn shutdown(&self) {
        if let Some(listener) = self.inner.provider_listener.lock().unwrap().take() {
            listener.abort();
        }
        self.stop_all();
    }

    /// Projects a confirmation window for the offered fees onto the current
    /// estimates. `None` while the state holds no EIP-1559 data.
    pub fn estimate_time_bounds(
        &self,
        max_priority_fee_per_gas: FeePerGas,
        max_fee_per_gas: FeePerGas,
    ) -> Option<TimeBounds> {
        match &self.inner.state.borrow().state.estimates {
            GasFeeEstimates::Eip1559(estimates) => Some(time_bounds::estimate_time_bounds(
                max_priority_fee_per_gas,
                max_fee_per_gas,
                estimates,
            )),
            _ => None,
        }
    }

    /// The most recently published state.
    pub fn current_state(&self) -> GasFeeState {
        self.inner.state.borrow().state.clone()
    }

    /// Subscribes to published state changes.
    pub fn state_watcher(&self) -> StateWatcher {
        self.inner.state.subscribe()
    }
}

struct Inner {
    update_interval: Duration,
    fetcher: Arc<dyn Eip1559EstimateFetching>,
    network: Arc<dyn NetworkCompatibility>,
    account: Option<Arc<dyn AccountCompatibility>>,
    /// Replaced by the provider listener whenever the network changes.
    provider: RwLock<Arc<dyn GasPriceQuerying>>,
    state: watch::Sender<StateChange>,
    /// Serializes update cycles so no two of them interleave their reads and
    /// writes of `state`.
    update_lock: tokio::sync::Mutex<()>,
    /// Subscribers currently keeping the poll timer alive.
    poll_tokens: Mutex<HashSet<PollToken>>,
    /// Handle of the poll timer task while one is armed.
    poller: Mutex<Option<JoinHandle<()>>>,
    /// Handle of the task listening for network changes.
    provider_listener: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    /// Runs one serialized fetch cycle: EIP-1559 estimates when network and
    /// account allow them, the legacy gas price otherwise or as fallback. On
    /// success the result replaces the published state.
    async fn update_once(&self) -> Result<GasFeeState, EstimationUnavailable> {
        let _cycle = self.update_lock.lock().await;
        match self.fetch_state().await {
            Ok(state) => {
                let outcome = match &state.estimates {
                    GasFeeEstimates::Eip1559(_) => "eip1559",
                    GasFeeEstimates::Legacy(_) => "legacy",
                    GasFeeEstimates::Empty => "empty",
                };
                Metrics::get()
                    .gas_fee_updates
                    .with_label_values(&[outcome])
                    .inc();
                self.publish(state.clone());
                Ok(state)
            }
            Err(err) => {
                Metrics::get()
                    .gas_fee_updates
                    .with_label_values(&["failure"])
                    .inc();
                Err(err)
            }
        }
    }

    /// Determines the new state without publishing it.
    async fn fetch_state(&self) -> Result<GasFeeState, EstimationUnavailable> {
        if self.eip1559_compatible().await {
            match self.fetcher.eip1559_estimates().await {
                Ok(estimates) => {
                    // The window is computed against the estimates fetched in
                    // this very cycle, not whatever was published before.
                    let time_bounds = time_bounds::estimate_time_bounds(
                        estimates.medium.suggested_max_priority_fee_per_gas,
                        estimates.medium.suggested_max_fee_per_gas,
                        &estimates,
                    );
                    return Ok(GasFeeState {
                        estimates: GasFeeEstimates::Eip1559(estimates),
                        time_bounds: Some(time_bounds),
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        ?err,
                        "eip1559 estimate fetch failed, falling back to the legacy gas price"
                    );
                }
            }
        }
        let provider = self.provider.read().unwrap().clone();
        let gas_price = provider
            .gas_price()
            .await
            .context("legacy gas price query failed")?;
        Ok(GasFeeState {
            estimates: GasFeeEstimates::Legacy(LegacyEstimates {
                gas_price: FeePerGas(gas_price),
            }),
            time_bounds: None,
        })
    }

    /// Whether both the network and the selected account can use EIP-1559
    /// fees. A failing network check counts as "no".
    async fn eip1559_compatible(&self) -> bool {
        let network = match self.network.supports_eip1559().await {
            Ok(supported) => supported,
            Err(err) => {
                tracing::warn!(?err, "network compatibility check failed, assuming legacy fees");
                false
            }
        };
        let account = self
            .account
            .as_ref()
            .map(|account| account.supports_eip1559())
            .unwrap_or(true);
        network && account
    }

    /// Atomically replaces the published state, recording what changed.
    /// Subscribers get notified even when nothing did.
    fn publish(&self, state: GasFeeState) {
        self.state.send_modify(|change| {
            let diff = change.state.diff(&state);
            *change = StateChange { state, diff };
        });
    }

    /// Stops the poll timer and resets the published state. Expects the
    /// already locked token set.
    ///
    /// Aborting the timer is what guarantees that no further tick fires; a
    /// tick that already passed its sleep may still publish one last result.
    fn halt_polling(&self, tokens: &mut HashSet<PollToken>) {
        tokens.clear();
        Metrics::get().gas_fee_poll_tokens.set(0);
        if let Some(poller) = self.poller.lock().unwrap().take() {
            poller.abort();
        }
        self.publish(GasFeeState::default());
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for handle in [
            self.poller.get_mut().unwrap().take(),
            self.provider_listener.get_mut().unwrap().take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

/// Adds `token` to the live set, arming the poll timer if none runs yet.
fn register_and_arm(inner: &Arc<Inner>, token: PollToken) {
    let mut tokens = inner.poll_tokens.lock().unwrap();
    tokens.insert(token);
    Metrics::get()
        .gas_fee_poll_tokens
        .set(i64::try_from(tokens.len()).unwrap_or(i64::MAX));
    let mut poller = inner.poller.lock().unwrap();
    if poller.is_none() {
        *poller = Some(tokio::task::spawn(
            poll_task(Arc::downgrade(inner), inner.update_interval)
                .instrument(tracing::info_span!("gas_fee_poller")),
        ));
    }
}

/// Repeatedly runs update cycles. Failures are logged and the next tick runs
/// anyway; only aborting the task stops it.
async fn poll_task(inner: Weak<Inner>, update_interval: Duration) {
    loop {
        tokio::time::sleep(update_interval).await;
        let Some(inner) = inner.upgrade() else { return };
        if let Err(err) = inner.update_once().await {
            tracing::warn!(?err, "scheduled gas fee update failed");
        }
    }
}

/// Tracks network changes by replacing the legacy query provider. No fetch
/// happens on a change; stale estimates persist until the next cycle.
async fn provider_listener(
    inner: Weak<Inner>,
    mut updates: watch::Receiver<Arc<dyn GasPriceQuerying>>,
) {
    while updates.changed().await.is_ok() {
        let provider = updates.borrow_and_update().clone();
        let Some(inner) = inner.upgrade() else { return };
        *inner.provider.write().unwrap() = provider;
        tracing::debug!("replaced gas price provider after network change");
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// gas fee update cycles by outcome
    #[metric(labels("outcome"))]
    gas_fee_updates: IntCounterVec,
    /// subscribers currently keeping the poll timer alive
    gas_fee_poll_tokens: IntGauge,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}
