use chrono::Utc;
use std::future::pending;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::credentials::{discard_credential, load_credential, save_credential, CredentialStore};
use super::provider::OAuthProvider;
use super::types::{Credential, LifecycleState, LifecycleStatus, Principal};
use crate::error::{AuthError, ManagerClosed};

/// Timing and gating knobs for the lifecycle
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Only principals of this company get a managed credential
    pub gated_company: String,
    /// Quiet period after a principal change before acting on it
    pub debounce: Duration,
    /// Period of the refresh timer
    pub refresh_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            gated_company: "Procure".to_string(),
            debounce: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(30),
        }
    }
}

enum Command {
    Principal(Option<Principal>),
    SignIn,
    Shutdown,
}

/// Completion of a spawned consent flow
struct ConsentDone {
    generation: u64,
    result: Result<Credential, AuthError>,
}

/// Credential lifecycle manager
///
/// Owns one background task that reacts to principal changes, runs the
/// consent flow when no credential is stored and keeps a stored credential
/// fresh on a fixed interval. Dropping the handle tears the task down.
pub struct CredentialManager {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<LifecycleStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CredentialManager {
    /// Start the lifecycle task on the current tokio runtime
    pub fn spawn(
        provider: Arc<dyn OAuthProvider>,
        store: Arc<dyn CredentialStore>,
        settings: ManagerSettings,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (consent_tx, consent_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(LifecycleStatus::default());

        tracing::info!(
            gated_company = %settings.gated_company,
            debounce_ms = settings.debounce.as_millis() as u64,
            refresh_interval_secs = settings.refresh_interval.as_secs(),
            "Starting credential manager"
        );

        let lifecycle = Lifecycle {
            provider,
            store,
            settings,
            commands: commands_rx,
            consent_tx,
            consent_rx,
            status: status_tx,
            state: LifecycleState::Idle,
            principal: None,
            generation: 0,
            debounce_deadline: None,
            refresh_timer: None,
            consent_tasks: Vec::new(),
            consent_attempts: 0,
            refresh_cycles: 0,
            refresh_failures: 0,
            last_refresh_at: None,
            last_error: None,
        };

        let task = tokio::spawn(lifecycle.run());

        Self {
            commands: commands_tx,
            status: status_rx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Report the currently signed-in principal (`None` when signed out)
    pub fn set_principal(&self, principal: Option<Principal>) -> Result<(), ManagerClosed> {
        self.commands
            .send(Command::Principal(principal))
            .map_err(|_| ManagerClosed)
    }

    /// Start the interactive consent flow on demand
    pub fn sign_in(&self) -> Result<(), ManagerClosed> {
        self.commands.send(Command::SignIn).map_err(|_| ManagerClosed)
    }

    /// Latest published status
    pub fn status(&self) -> LifecycleStatus {
        self.status.borrow().clone()
    }

    /// Watch status transitions
    pub fn subscribe(&self) -> watch::Receiver<LifecycleStatus> {
        self.status.clone()
    }

    /// Stop the lifecycle task, cancelling both timers, and wait for it to exit
    pub async fn shutdown(&self) {
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(task) = task {
            let _ = self.commands.send(Command::Shutdown);
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!("Credential manager task failed: {}", e);
                }
            }
            tracing::info!("Credential manager stopped");
        }
    }
}

impl Drop for CredentialManager {
    fn drop(&mut self) {
        let task = match self.task.get_mut() {
            Ok(task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// State owned by the lifecycle task
struct Lifecycle {
    provider: Arc<dyn OAuthProvider>,
    store: Arc<dyn CredentialStore>,
    settings: ManagerSettings,

    commands: mpsc::UnboundedReceiver<Command>,
    consent_tx: mpsc::UnboundedSender<ConsentDone>,
    consent_rx: mpsc::UnboundedReceiver<ConsentDone>,
    status: watch::Sender<LifecycleStatus>,

    state: LifecycleState,
    principal: Option<Principal>,
    /// Bumped on every principal change; failed completions tagged with an
    /// older generation leave the state alone
    generation: u64,

    debounce_deadline: Option<Instant>,
    refresh_timer: Option<Interval>,
    consent_tasks: Vec<JoinHandle<()>>,

    consent_attempts: u64,
    refresh_cycles: u64,
    refresh_failures: u64,
    last_refresh_at: Option<chrono::DateTime<Utc>>,
    last_error: Option<String>,
}

impl Lifecycle {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Principal(principal)) => self.on_principal_changed(principal),
                    Some(Command::SignIn) => {
                        tracing::info!("Manual Google sign-in requested");
                        self.start_consent();
                    }
                    Some(Command::Shutdown) | None => break,
                },

                Some(done) = self.consent_rx.recv() => self.on_consent_finished(done),

                _ = debounce_elapsed(self.debounce_deadline) => {
                    self.debounce_deadline = None;
                    self.activate().await;
                }

                _ = next_refresh_tick(&mut self.refresh_timer) => self.on_refresh_tick().await,
            }

            self.publish();
        }

        self.teardown();
    }

    fn on_principal_changed(&mut self, principal: Option<Principal>) {
        if principal == self.principal {
            tracing::debug!("Principal unchanged, ignoring");
            return;
        }

        tracing::info!(
            principal = ?principal.as_ref().map(|p| &p.id),
            company = ?principal.as_ref().map(|p| &p.company),
            "Principal changed"
        );

        self.generation += 1;
        self.cancel_refresh_timer();
        self.state = LifecycleState::Idle;
        self.principal = principal;
        self.debounce_deadline = Some(Instant::now() + self.settings.debounce);
    }

    /// Decision procedure, run once the debounce period has passed
    async fn activate(&mut self) {
        let gated = self
            .principal
            .as_ref()
            .is_some_and(|p| p.company == self.settings.gated_company);

        if !gated {
            tracing::debug!("No gated principal, credential management inactive");
            self.cancel_refresh_timer();
            self.state = LifecycleState::Idle;
            return;
        }

        match load_credential(self.store.as_ref()) {
            None => {
                tracing::info!("No stored Google credential, starting consent flow");
                self.start_consent();
            }
            Some(credential) => {
                self.refresh_cycle(credential).await;
                if load_credential(self.store.as_ref()).is_none() {
                    tracing::info!("Stored credential was revoked, starting consent flow");
                    self.start_consent();
                    return;
                }
                self.arm_refresh_timer();
            }
        }
    }

    async fn on_refresh_tick(&mut self) {
        let Some(credential) = load_credential(self.store.as_ref()) else {
            tracing::warn!("Stored credential disappeared, starting consent flow");
            self.cancel_refresh_timer();
            self.start_consent();
            return;
        };

        self.refresh_cycle(credential).await;
    }

    /// One refresh attempt; the provider's answer is written back when it changed
    ///
    /// Failures never touch the timer. A revoked refresh token removes the
    /// stored credential so the next tick falls through to consent.
    async fn refresh_cycle(&mut self, current: Credential) {
        self.refresh_cycles += 1;

        match self.provider.refresh_if_expired(&current).await {
            Ok(next) => {
                self.last_refresh_at = Some(Utc::now());
                if next != current {
                    if let Err(e) = save_credential(self.store.as_ref(), &next) {
                        let err = AuthError::Storage(format!("{:#}", e));
                        tracing::error!(kind = err.kind(), "Failed to store refreshed credential: {}", err);
                        self.last_error = Some(err.to_string());
                        return;
                    }
                    tracing::info!("Stored refreshed credential (token: {}...)", next.token_hint());
                }
            }
            Err(AuthError::Revoked(reason)) => {
                self.refresh_failures += 1;
                tracing::warn!("Refresh token revoked ({}), discarding stored credential", reason);
                if let Err(e) = discard_credential(self.store.as_ref()) {
                    tracing::error!("Failed to discard revoked credential: {:#}", e);
                }
                self.last_error = Some(AuthError::Revoked(reason).to_string());
            }
            Err(e) => {
                self.refresh_failures += 1;
                tracing::error!(kind = e.kind(), "Token refresh failed: {}", e);
                self.last_error = Some(e.to_string());
            }
        }
    }

    fn start_consent(&mut self) {
        self.consent_attempts += 1;
        if self.refresh_timer.is_none() {
            self.state = LifecycleState::AwaitingConsent;
        }

        let provider = Arc::clone(&self.provider);
        let done_tx = self.consent_tx.clone();
        let generation = self.generation;

        let handle = tokio::spawn(async move {
            let result = provider.sign_in().await;
            let _ = done_tx.send(ConsentDone { generation, result });
        });

        self.consent_tasks.retain(|task| !task.is_finished());
        self.consent_tasks.push(handle);
    }

    fn on_consent_finished(&mut self, done: ConsentDone) {
        let current = done.generation == self.generation;

        let credential = match done.result {
            Ok(credential) => credential,
            Err(e) => {
                tracing::warn!(kind = e.kind(), "Google sign-in failed: {}", e);
                self.last_error = Some(e.to_string());
                if current && self.state == LifecycleState::AwaitingConsent {
                    self.state = LifecycleState::Idle;
                }
                return;
            }
        };

        if let Err(e) = save_credential(self.store.as_ref(), &credential) {
            let err = AuthError::Storage(format!("{:#}", e));
            tracing::error!(kind = err.kind(), "Failed to store new credential: {}", err);
            self.last_error = Some(err.to_string());
            if current && self.state == LifecycleState::AwaitingConsent {
                self.state = LifecycleState::Idle;
            }
            return;
        }
        tracing::info!("Stored new Google credential (token: {}...)", credential.token_hint());

        let gated = self
            .principal
            .as_ref()
            .is_some_and(|p| p.company == self.settings.gated_company);

        // A pending debounce will re-run activation and pick the credential up
        if gated && self.debounce_deadline.is_none() && self.refresh_timer.is_none() {
            if !current {
                tracing::debug!("Consent from an earlier activation satisfies the current principal");
            }
            self.arm_refresh_timer();
        } else if current && self.state == LifecycleState::AwaitingConsent {
            self.state = LifecycleState::Idle;
        }
    }

    /// Arm the periodic refresh; the first tick is one full interval away
    fn arm_refresh_timer(&mut self) {
        let period = self.settings.refresh_interval;
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.refresh_timer = Some(timer);
        self.state = LifecycleState::Scheduled;
        tracing::debug!("Refresh timer armed ({}s)", period.as_secs());
    }

    fn cancel_refresh_timer(&mut self) {
        if self.refresh_timer.take().is_some() {
            tracing::debug!("Refresh timer cancelled");
        }
    }

    fn teardown(&mut self) {
        self.debounce_deadline = None;
        self.cancel_refresh_timer();
        for task in self.consent_tasks.drain(..) {
            task.abort();
        }
        self.state = LifecycleState::Idle;
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(LifecycleStatus {
            state: self.state,
            principal: self.principal.clone(),
            timer_armed: self.refresh_timer.is_some(),
            consent_attempts: self.consent_attempts,
            refresh_cycles: self.refresh_cycles,
            refresh_failures: self.refresh_failures,
            last_refresh_at: self.last_refresh_at,
            last_error: self.last_error.clone(),
        });
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        // Covers the abort path, where `teardown` never runs
        for task in self.consent_tasks.drain(..) {
            task.abort();
        }
    }
}

async fn debounce_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn next_refresh_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::MemoryStore;
    use crate::auth::types::CREDENTIAL_KEY;
    use chrono::Duration as ChronoDuration;
    use futures::future::BoxFuture;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::sleep;

    /// Provider that records calls and answers instantly
    #[derive(Default)]
    struct RecordingProvider {
        sign_ins: AtomicUsize,
        refreshes: AtomicUsize,
        fail_refreshes: AtomicUsize,
        revoke_next: AtomicBool,
        deny_consent: AtomicBool,
    }

    impl RecordingProvider {
        fn sign_ins(&self) -> usize {
            self.sign_ins.load(Ordering::SeqCst)
        }

        fn refreshes(&self) -> usize {
            self.refreshes.load(Ordering::SeqCst)
        }
    }

    impl OAuthProvider for RecordingProvider {
        fn sign_in(&self) -> BoxFuture<'_, Result<Credential, AuthError>> {
            Box::pin(async move {
                self.sign_ins.fetch_add(1, Ordering::SeqCst);
                if self.deny_consent.load(Ordering::SeqCst) {
                    return Err(AuthError::ConsentDenied("access_denied".to_string()));
                }
                Ok(credential("ya29.consented"))
            })
        }

        fn refresh_if_expired<'a>(
            &'a self,
            current: &'a Credential,
        ) -> BoxFuture<'a, Result<Credential, AuthError>> {
            Box::pin(async move {
                let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
                if self.revoke_next.swap(false, Ordering::SeqCst) {
                    return Err(AuthError::Revoked("Token has been revoked.".to_string()));
                }
                if self
                    .fail_refreshes
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                    .is_ok()
                {
                    return Err(AuthError::Upstream {
                        status: 503,
                        message: "backendError".to_string(),
                    });
                }
                Ok(Credential {
                    access_token: format!("ya29.refreshed-{}", n),
                    ..current.clone()
                })
            })
        }
    }

    /// First consent completes after 5s; later ones are abandoned after 300s
    #[derive(Default)]
    struct StaggeredConsentProvider {
        sign_ins: AtomicUsize,
        refreshes: AtomicUsize,
    }

    impl OAuthProvider for StaggeredConsentProvider {
        fn sign_in(&self) -> BoxFuture<'_, Result<Credential, AuthError>> {
            Box::pin(async move {
                if self.sign_ins.fetch_add(1, Ordering::SeqCst) == 0 {
                    sleep(secs(5)).await;
                    return Ok(credential("ya29.first-window"));
                }
                sleep(secs(300)).await;
                Err(AuthError::ConsentTimeout(300))
            })
        }

        fn refresh_if_expired<'a>(
            &'a self,
            current: &'a Credential,
        ) -> BoxFuture<'a, Result<Credential, AuthError>> {
            Box::pin(async move {
                self.refreshes.fetch_add(1, Ordering::SeqCst);
                Ok(current.clone())
            })
        }
    }

    fn credential(token: &str) -> Credential {
        Credential {
            access_token: token.to_string(),
            refresh_token: "1//refresh".to_string(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        }
    }

    fn procure(id: &str) -> Option<Principal> {
        Some(Principal::new(id, "Procure"))
    }

    fn setup() -> (CredentialManager, Arc<RecordingProvider>, Arc<MemoryStore>) {
        let provider = Arc::new(RecordingProvider::default());
        let store = Arc::new(MemoryStore::new());
        let manager = CredentialManager::spawn(
            provider.clone(),
            store.clone(),
            ManagerSettings::default(),
        );
        (manager, provider, store)
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn millis(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_lifecycle_scenario() {
        let (manager, provider, store) = setup();

        manager.set_principal(None).unwrap();
        manager.set_principal(procure("ana")).unwrap();
        sleep(millis(1100)).await;
        assert_eq!(provider.sign_ins(), 1);
        assert_eq!(provider.refreshes(), 0);
        assert!(load_credential(store.as_ref()).is_some());

        let status = manager.status();
        assert_eq!(status.state, LifecycleState::Scheduled);
        assert!(status.timer_armed);

        sleep(secs(90)).await;
        assert_eq!(provider.refreshes(), 3);

        manager
            .set_principal(Some(Principal::new("ana", "Other")))
            .unwrap();
        sleep(millis(10)).await;
        assert!(!manager.status().timer_armed);

        sleep(secs(120)).await;
        assert_eq!(provider.refreshes(), 3);
        assert_eq!(provider.sign_ins(), 1);
        assert_eq!(manager.status().state, LifecycleState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stored_credential_refreshes_immediately_then_every_interval() {
        let (manager, provider, store) = setup();
        save_credential(store.as_ref(), &credential("ya29.stored")).unwrap();

        manager.set_principal(procure("ana")).unwrap();
        sleep(millis(999)).await;
        assert_eq!(provider.refreshes(), 0);

        sleep(millis(101)).await;
        assert_eq!(provider.refreshes(), 1);
        assert_eq!(provider.sign_ins(), 0);

        sleep(secs(29)).await;
        assert_eq!(provider.refreshes(), 1);
        sleep(secs(1)).await;
        assert_eq!(provider.refreshes(), 2);
        sleep(secs(30)).await;
        assert_eq!(provider.refreshes(), 3);

        // Refreshed token written back by the manager
        let stored = load_credential(store.as_ref()).unwrap();
        assert_eq!(stored.access_token, "ya29.refreshed-3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_gated_principal_never_acts() {
        let (manager, provider, store) = setup();
        save_credential(store.as_ref(), &credential("ya29.stored")).unwrap();

        manager
            .set_principal(Some(Principal::new("bob", "Acme")))
            .unwrap();
        sleep(secs(300)).await;

        assert_eq!(provider.sign_ins(), 0);
        assert_eq!(provider.refreshes(), 0);
        assert_eq!(manager.status().state, LifecycleState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_credential_one_consent_per_activation() {
        let (manager, provider, _store) = setup();
        provider.deny_consent.store(true, Ordering::SeqCst);

        manager.set_principal(procure("ana")).unwrap();
        sleep(secs(2)).await;
        assert_eq!(provider.sign_ins(), 1);
        assert_eq!(manager.status().state, LifecycleState::Idle);
        assert!(manager.status().last_error.is_some());

        // Denied consent does not retry on its own
        sleep(secs(120)).await;
        assert_eq!(provider.sign_ins(), 1);

        manager.set_principal(procure("bia")).unwrap();
        sleep(secs(2)).await;
        assert_eq!(provider.sign_ins(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_restarts_on_rapid_changes() {
        let (manager, provider, _store) = setup();

        manager.set_principal(procure("ana")).unwrap();
        sleep(millis(500)).await;
        manager.set_principal(procure("bia")).unwrap();
        sleep(millis(500)).await;
        manager.set_principal(procure("caio")).unwrap();
        sleep(millis(900)).await;
        assert_eq!(provider.sign_ins(), 0);

        sleep(millis(200)).await;
        assert_eq!(provider.sign_ins(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_signed_out_state_is_ignored() {
        let (manager, provider, _store) = setup();

        manager.set_principal(procure("ana")).unwrap();
        sleep(millis(300)).await;
        manager.set_principal(None).unwrap();
        sleep(millis(300)).await;
        manager.set_principal(procure("ana")).unwrap();
        sleep(secs(2)).await;

        assert_eq!(provider.sign_ins(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_principal_is_not_a_change() {
        let (manager, provider, store) = setup();
        save_credential(store.as_ref(), &credential("ya29.stored")).unwrap();

        manager.set_principal(procure("ana")).unwrap();
        sleep(millis(1100)).await;
        assert_eq!(provider.refreshes(), 1);

        manager.set_principal(procure("ana")).unwrap();
        sleep(secs(30)).await;
        assert_eq!(provider.refreshes(), 2);
        assert!(manager.status().timer_armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_keeps_timer() {
        let (manager, provider, store) = setup();
        save_credential(store.as_ref(), &credential("ya29.stored")).unwrap();

        manager.set_principal(procure("ana")).unwrap();
        sleep(millis(1100)).await;
        assert_eq!(provider.refreshes(), 1);

        provider.fail_refreshes.store(1, Ordering::SeqCst);
        sleep(secs(30)).await;
        assert_eq!(provider.refreshes(), 2);

        let status = manager.status();
        assert!(status.timer_armed);
        assert_eq!(status.refresh_failures, 1);
        assert!(status.last_error.unwrap().contains("503"));

        sleep(secs(30)).await;
        assert_eq!(provider.refreshes(), 3);
        assert_eq!(
            load_credential(store.as_ref()).unwrap().access_token,
            "ya29.refreshed-3"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_credential_is_discarded_and_next_tick_consents() {
        let (manager, provider, store) = setup();
        save_credential(store.as_ref(), &credential("ya29.stored")).unwrap();

        manager.set_principal(procure("ana")).unwrap();
        sleep(millis(1100)).await;

        provider.revoke_next.store(true, Ordering::SeqCst);
        provider.deny_consent.store(true, Ordering::SeqCst);
        sleep(secs(30)).await;

        assert_eq!(provider.refreshes(), 2);
        assert_eq!(provider.sign_ins(), 0);
        assert!(store.get(CREDENTIAL_KEY).unwrap().is_none());
        assert!(manager.status().timer_armed);

        sleep(secs(30)).await;
        assert_eq!(provider.sign_ins(), 1);
        assert!(!manager.status().timer_armed);

        sleep(secs(120)).await;
        assert_eq!(provider.refreshes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_during_activation_consents_immediately() {
        let (manager, provider, store) = setup();
        save_credential(store.as_ref(), &credential("ya29.stored")).unwrap();
        provider.revoke_next.store(true, Ordering::SeqCst);

        manager.set_principal(procure("ana")).unwrap();
        sleep(millis(1100)).await;

        assert_eq!(provider.refreshes(), 1);
        assert_eq!(provider.sign_ins(), 1);
        assert_eq!(
            load_credential(store.as_ref()).unwrap().access_token,
            "ya29.consented"
        );
        assert_eq!(manager.status().state, LifecycleState::Scheduled);

        sleep(secs(30)).await;
        assert_eq!(provider.refreshes(), 2);
        assert_eq!(provider.sign_ins(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_consents_earlier_grant_still_schedules() {
        let provider = Arc::new(StaggeredConsentProvider::default());
        let store = Arc::new(MemoryStore::new());
        let manager = CredentialManager::spawn(
            provider.clone(),
            store.clone(),
            ManagerSettings::default(),
        );

        manager.set_principal(procure("ana")).unwrap();
        sleep(millis(1100)).await;
        assert_eq!(provider.sign_ins.load(Ordering::SeqCst), 1);

        // Signed-out blip: a second activation starts its own consent
        manager.set_principal(None).unwrap();
        manager.set_principal(procure("ana")).unwrap();
        sleep(secs(600)).await;

        assert_eq!(provider.sign_ins.load(Ordering::SeqCst), 2);
        assert!(load_credential(store.as_ref()).is_some());

        let status = manager.status();
        assert!(status.timer_armed);
        assert_eq!(status.state, LifecycleState::Scheduled);
        assert!(provider.refreshes.load(Ordering::SeqCst) >= 18);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_all_timers() {
        let (manager, provider, store) = setup();
        save_credential(store.as_ref(), &credential("ya29.stored")).unwrap();

        manager.set_principal(procure("ana")).unwrap();
        sleep(millis(1100)).await;
        assert_eq!(provider.refreshes(), 1);

        manager.shutdown().await;
        assert!(!manager.status().timer_armed);
        assert!(manager.set_principal(procure("bia")).is_err());

        sleep(secs(300)).await;
        assert_eq!(provider.refreshes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_debounce() {
        let (manager, provider, _store) = setup();

        manager.set_principal(procure("ana")).unwrap();
        sleep(millis(500)).await;
        manager.shutdown().await;

        sleep(secs(10)).await;
        assert_eq!(provider.sign_ins(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_tears_down() {
        let (manager, provider, store) = setup();
        save_credential(store.as_ref(), &credential("ya29.stored")).unwrap();

        manager.set_principal(procure("ana")).unwrap();
        sleep(millis(1100)).await;
        drop(manager);

        sleep(secs(300)).await;
        assert_eq!(provider.refreshes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_sign_in_without_principal() {
        let (manager, provider, store) = setup();

        manager.sign_in().unwrap();
        sleep(millis(10)).await;

        assert_eq!(provider.sign_ins(), 1);
        assert!(load_credential(store.as_ref()).is_some());
        // Nobody gated is signed in, so nothing gets scheduled
        assert!(!manager.status().timer_armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_sign_in_while_scheduled_keeps_one_timer() {
        let (manager, provider, store) = setup();
        save_credential(store.as_ref(), &credential("ya29.stored")).unwrap();

        manager.set_principal(procure("ana")).unwrap();
        sleep(millis(1100)).await;

        manager.sign_in().unwrap();
        sleep(millis(10)).await;
        assert_eq!(provider.sign_ins(), 1);
        assert_eq!(manager.status().state, LifecycleState::Scheduled);

        sleep(secs(30)).await;
        assert_eq!(provider.refreshes(), 2);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Gated(u8),
        Other(u8),
        SignedOut,
    }

    fn step_strategy() -> impl Strategy<Value = (Step, u64)> {
        let step = prop_oneof![
            (0u8..3).prop_map(Step::Gated),
            (0u8..3).prop_map(Step::Other),
            Just(Step::SignedOut),
        ];
        (step, 0u64..70_000)
    }

    fn principal_for(step: &Step) -> Option<Principal> {
        match step {
            Step::Gated(n) => Some(Principal::new(format!("user-{}", n), "Procure")),
            Step::Other(n) => Some(Principal::new(format!("user-{}", n), "Other")),
            Step::SignedOut => None,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Whatever came before, the last change alone decides what runs next
        #[test]
        fn prop_last_change_owns_the_only_timer(
            steps in proptest::collection::vec(step_strategy(), 0..12),
            final_gated in any::<bool>(),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();

            let (before, after, armed) = rt.block_on(async {
                let (manager, provider, store) = setup();
                save_credential(store.as_ref(), &credential("ya29.stored")).unwrap();

                for (step, delay_ms) in &steps {
                    manager.set_principal(principal_for(step)).unwrap();
                    sleep(millis(*delay_ms)).await;
                }

                let company = if final_gated { "Procure" } else { "Other" };
                manager
                    .set_principal(Some(Principal::new("final-user", company)))
                    .unwrap();
                sleep(millis(1)).await;
                let before = provider.refreshes();

                // debounce, immediate cycle, then three ticks
                sleep(millis(999 + 90_000 + 500)).await;
                let after = provider.refreshes();
                (before, after, manager.status().timer_armed)
            });

            if final_gated {
                prop_assert_eq!(after - before, 4);
                prop_assert!(armed);
            } else {
                prop_assert_eq!(after - before, 0);
                prop_assert!(!armed);
            }
        }
    }
}
