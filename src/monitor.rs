//! The top-level scheduler.
//!
//! One task drives the polling tick, the scheduled credential refresh and the
//! priority refresh after a rejected credential. Ticks never overlap, and the
//! monitor is the only owner and writer of [`MonitorState`].

use std::time::Duration;

use anyhow::{Result, bail};
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::SaleFeed;
use crate::config::SettingsConfig;
use crate::credential::{
    CredentialHolder, CredentialProvider, CredentialRefresher, CredentialStatus,
};
use crate::notifier::{Delivery, Notifier, Publisher};
use crate::pager::{Backfill, Pager};
use crate::reporter;
use crate::retry::{RetryError, RetryPolicy};
use crate::state::{MonitorState, StateFile};
use crate::types::{DeliveryStatus, NotificationEvent, RunSummary};

/// Where the monitor is in its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No credential yet.
    Bootstrapping,
    Polling,
    Refreshing,
    /// The last tick gave up; the next tick polls normally.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub check_interval: Duration,
    pub token_refresh_interval: Duration,
    pub credential_retry: Duration,
    pub max_pages: u32,
    pub initial_backlog: usize,
    pub dedup_capacity: usize,
    pub dedup_safety_window: chrono::Duration,
}

impl From<&SettingsConfig> for MonitorSettings {
    fn from(s: &SettingsConfig) -> Self {
        Self {
            check_interval: s.check_interval(),
            token_refresh_interval: s.token_refresh_interval(),
            credential_retry: s.credential_retry(),
            max_pages: s.max_pages_per_tick.max(1),
            initial_backlog: s.initial_backlog,
            dedup_capacity: s.dedup_capacity,
            dedup_safety_window: chrono::Duration::seconds(s.dedup_safety_window_secs.max(0)),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub pages_fetched: u32,
    pub notified: usize,
    pub suppressed: usize,
    pub failed: usize,
    /// The pass failed; nothing was delivered.
    pub degraded: bool,
    /// Shutdown was requested part-way through the sales.
    pub interrupted: bool,
}

pub struct Monitor<F, P> {
    feed: F,
    provider: Box<dyn CredentialProvider>,
    notifier: Notifier<P>,
    holder: CredentialHolder,
    state: MonitorState,
    state_file: StateFile,
    policy: RetryPolicy,
    settings: MonitorSettings,
    phase: Phase,
    summary: RunSummary,
    last_credential_attempt: Option<Instant>,
}

impl<F: SaleFeed, P: Publisher> Monitor<F, P> {
    /// Load persisted state and reinstall any persisted credential.
    pub fn new(
        feed: F,
        provider: Box<dyn CredentialProvider>,
        notifier: Notifier<P>,
        state_file: StateFile,
        policy: RetryPolicy,
        settings: MonitorSettings,
    ) -> Self {
        let mut state = state_file.load();
        state
            .dedup
            .configure(settings.dedup_capacity, settings.dedup_safety_window);

        let holder = CredentialHolder::new();
        if let Some(credential) = state.credential.clone() {
            info!("Reusing persisted credential {}", credential.fingerprint());
            holder.set(credential);
        }

        Self {
            feed,
            provider,
            notifier,
            holder,
            state,
            state_file,
            policy,
            settings,
            phase: Phase::Bootstrapping,
            summary: RunSummary::default(),
            last_credential_attempt: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn holder(&self) -> &CredentialHolder {
        &self.holder
    }

    pub fn notifier(&self) -> &Notifier<P> {
        &self.notifier
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            seen_ids: self.state.dedup.len(),
            ..self.summary.clone()
        }
    }

    /// Obtain a first credential, or replace a persisted one that is due.
    pub async fn bootstrap(&mut self) -> bool {
        let now = Utc::now();
        if !self
            .holder
            .needs_refresh(now, self.settings.token_refresh_interval)
        {
            self.phase = Phase::Polling;
            return true;
        }
        let reason = if self.holder.get().is_ok() {
            "persisted credential is due"
        } else {
            "bootstrap"
        };
        self.refresh_credential(reason).await
    }

    /// Rotate the credential through the provider. Failure is logged and
    /// retried later, never fatal.
    pub async fn refresh_credential(&mut self, reason: &str) -> bool {
        let had_credential = self.holder.get().is_ok();
        self.phase = Phase::Refreshing;
        self.last_credential_attempt = Some(Instant::now());

        let refresher = CredentialRefresher {
            holder: &self.holder,
            provider: self.provider.as_ref(),
        };
        let ok = refresher.refresh(reason).await.is_ok();

        self.sync_credential();
        self.flush();
        self.phase = if ok || had_credential {
            Phase::Polling
        } else {
            Phase::Bootstrapping
        };
        ok
    }

    /// A missing or rejected credential is refreshed ahead of the schedule,
    /// at most once per `credential_retry`.
    fn priority_refresh_due(&self) -> bool {
        let needs = match self.holder.get() {
            Ok(cred) => cred.status == CredentialStatus::Expired,
            Err(_) => true,
        };
        needs
            && self
                .last_credential_attempt
                .is_none_or(|t| t.elapsed() >= self.settings.credential_retry)
    }

    /// One polling cycle: collect new sales, then notify and record them
    /// oldest first. Only a publisher permission failure is an error.
    pub async fn tick(&mut self, shutdown: &watch::Receiver<bool>) -> Result<TickReport> {
        self.summary.ticks += 1;
        let mut report = TickReport::default();

        // A backfill only means something relative to recorded sales.
        if self.state.dedup.is_empty() {
            self.state.backfill = None;
        }
        let pending = self.state.backfill;

        let pager = Pager {
            feed: &self.feed,
            refresher: CredentialRefresher {
                holder: &self.holder,
                provider: self.provider.as_ref(),
            },
            policy: &self.policy,
            max_pages: self.settings.max_pages,
        };
        let result = pager.collect_new_sales(&self.state.dedup, pending).await;
        let mut dirty = self.sync_credential();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e.source, RetryError::AuthRejected(_)) {
                    self.holder.invalidate();
                    dirty |= self.sync_credential();
                }
                warn!("Tick degraded: {e}");
                self.phase = Phase::Degraded;
                self.summary.degraded_ticks += 1;
                if dirty {
                    self.flush();
                }
                report.degraded = true;
                return Ok(report);
            }
        };
        self.phase = Phase::Polling;
        report.pages_fetched = outcome.pages_fetched;
        self.summary.pages_fetched += u64::from(outcome.pages_fetched);
        self.state.last_poll_at = Some(Utc::now());

        if outcome.sales.is_empty() {
            debug!("No new sales");
            dirty |= outcome.backfill != pending;
            self.state.backfill = outcome.backfill;
            if dirty {
                self.flush();
            }
            return Ok(report);
        }

        // Until every sale below is handled, resume from whichever point is
        // lower so an interrupted tick cannot skip part of the gap.
        let resume = Backfill::lowest(pending, outcome.backfill);
        dirty |= resume != pending;
        self.state.backfill = resume;

        let fresh_start = self.state.dedup.is_empty();
        let notify_from = if fresh_start {
            outcome.sales.len().saturating_sub(self.settings.initial_backlog)
        } else {
            0
        };
        if notify_from > 0 {
            info!(
                "Fresh start: recording {} older sales without notifying, sending the newest {}",
                notify_from,
                outcome.sales.len() - notify_from
            );
        } else {
            info!("Detected {} new sale(s)", outcome.sales.len());
        }

        for (i, sale) in outcome.sales.iter().enumerate() {
            if self.state.dedup.contains(&sale.id) {
                continue;
            }

            let (status, pinned) = if i < notify_from {
                report.suppressed += 1;
                self.summary.sales_suppressed += 1;
                (DeliveryStatus::Suppressed, false)
            } else {
                if *shutdown.borrow() {
                    info!(
                        "Shutdown requested, leaving {} sale(s) for the next run",
                        outcome.sales.len() - i
                    );
                    report.interrupted = true;
                    break;
                }
                match self.notifier.notify(sale).await {
                    Delivery::Delivered { pinned } => {
                        report.notified += 1;
                        self.summary.sales_notified += 1;
                        (DeliveryStatus::Delivered, pinned)
                    }
                    Delivery::Failed => {
                        report.failed += 1;
                        self.summary.delivery_failures += 1;
                        (DeliveryStatus::Failed, false)
                    }
                    Delivery::PermissionDenied => {
                        self.summary.delivery_failures += 1;
                        self.state.dedup.record(&sale.id, sale.sold_at);
                        self.flush();
                        bail!("publisher denied permission to post; fix the bot's channel rights and restart");
                    }
                }
            };

            // Recorded regardless of delivery outcome.
            self.state.dedup.record(&sale.id, sale.sold_at);
            if status != DeliveryStatus::Suppressed {
                self.flush();
            }

            reporter::report_notification(&NotificationEvent {
                timestamp: Utc::now().to_rfc3339(),
                sale_id: sale.id.clone(),
                gift_name: sale.gift_name.clone(),
                gift_number: sale.gift_number,
                sale_price: sale.sale_price,
                sold_at: sale.sold_at,
                status,
                pinned,
            });
        }

        if !report.interrupted {
            dirty |= self.state.backfill != outcome.backfill;
            self.state.backfill = outcome.backfill;
        }
        if dirty || report.suppressed > 0 {
            self.flush();
        }
        Ok(report)
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<RunSummary> {
        info!(
            "Entering polling loop (interval: {:?}, token refresh: {:?})",
            self.settings.check_interval, self.settings.token_refresh_interval
        );
        if !*shutdown.borrow() {
            self.bootstrap().await;
        }

        let mut poll = tokio::time::interval(self.settings.check_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let refresh_every = self.settings.token_refresh_interval;
        let mut refresh = tokio::time::interval_at(Instant::now() + refresh_every, refresh_every);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown channel closed");
                        break;
                    }
                }
                _ = refresh.tick() => {
                    self.refresh_credential("scheduled").await;
                }
                _ = poll.tick() => {
                    if self.priority_refresh_due() {
                        let reason = if self.phase == Phase::Bootstrapping {
                            "bootstrap"
                        } else {
                            "credential rejected"
                        };
                        if !self.refresh_credential(reason).await && self.holder.get().is_err() {
                            warn!("No credential yet, retrying in {:?}", self.settings.credential_retry);
                            continue;
                        }
                    }
                    if self.holder.get().is_err() {
                        continue;
                    }
                    if let Err(e) = self.tick(&shutdown).await {
                        error!("{e:#}");
                        self.flush();
                        return Err(e);
                    }
                }
            }
        }

        info!("Shutdown signal received");
        self.flush();
        Ok(self.summary())
    }

    /// Copy the holder's credential into state. Returns whether it changed.
    fn sync_credential(&mut self) -> bool {
        let current = self.holder.get().ok();
        if current == self.state.credential {
            return false;
        }
        let rotated = match (&current, &self.state.credential) {
            (Some(new), Some(old)) => new.token != old.token || new.acquired_at != old.acquired_at,
            (Some(_), None) => true,
            _ => false,
        };
        if rotated {
            self.summary.credential_refreshes += 1;
        }
        self.state.credential = current;
        true
    }

    fn flush(&self) {
        if let Err(e) = self.state_file.save(&self.state) {
            error!("Could not save state: {e:#}");
        }
    }
}
