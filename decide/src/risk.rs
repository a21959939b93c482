//! 🛡️ Risk governor: kill switch, exposure caps, circuit breakers.
//!
//! Hard gates evaluated in order before any execution; the first failure
//! rejects with a named guard. Every gate that depends on external state
//! has an explicit unavailable → block branch — the governor never
//! proceeds on data it could not fetch.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use common::db::Db;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::config::{BreakerConfig, RiskConfig};
use crate::execution::adapter::AccountSnapshot;
use crate::metrics;

/// A rejected signal with the guard that fired.
#[derive(Debug, Clone, Serialize)]
pub struct RiskReject {
    pub guard: &'static str,
    pub detail: String,
}

/// One evaluated risk check, for the decision log.
#[derive(Debug, Clone, Serialize)]
pub struct RiskCheck {
    pub guard: &'static str,
    pub passed: bool,
    pub detail: String,
}

/// Outcome of the ordered gate walk: every check evaluated up to and
/// including the first failure.
pub struct GovernorVerdict {
    pub checks: Vec<RiskCheck>,
    pub reject: Option<RiskReject>,
    /// Set when the daily-drawdown gate fired; the caller persists the
    /// kill-switch activation.
    pub trip_kill_switch: Option<String>,
}

// ── Kill switch ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct KillSwitchState {
    pub active: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub cooldown_expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl KillSwitchState {
    /// Still blocking at `now`? An active switch with no recorded expiry
    /// blocks until explicitly cleared.
    pub fn blocking(&self, now: DateTime<Utc>) -> bool {
        self.active
            && match self.cooldown_expires_at {
                Some(expires) => now < expires,
                None => true,
            }
    }
}

/// Persisted singleton; survives restarts.
pub struct KillSwitch {
    db: Arc<Db>,
    state: Mutex<KillSwitchState>,
}

impl KillSwitch {
    pub async fn load(db: Arc<Db>) -> Result<Self> {
        let state = {
            let client = db.lock().await;
            let row = client
                .query_one(
                    "SELECT active, activated_at, cooldown_expires_at, reason
                     FROM kill_switch WHERE singleton",
                    &[],
                )
                .await?;
            KillSwitchState {
                active: row.get(0),
                activated_at: row.get(1),
                cooldown_expires_at: row.get(2),
                reason: row.get(3),
            }
        };
        if state.active {
            warn!("🛑 kill switch is ACTIVE from a previous run: {:?}", state.reason);
        }
        metrics::get().kill_switch_active.set(state.active as i64);
        Ok(Self {
            db,
            state: Mutex::new(state),
        })
    }

    pub fn snapshot(&self) -> KillSwitchState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn activate(&self, reason: &str, cooldown_hours: i64) -> Result<()> {
        let now = Utc::now();
        let expires = now + ChronoDuration::hours(cooldown_hours);
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.active = true;
            state.activated_at = Some(now);
            state.cooldown_expires_at = Some(expires);
            state.reason = Some(reason.to_string());
        }
        metrics::get().kill_switch_active.set(1);
        warn!("🛑 KILL SWITCH ACTIVATED until {expires}: {reason}");

        let client = self.db.lock().await;
        client
            .execute(
                "UPDATE kill_switch SET active = TRUE, activated_at = $1,
                 cooldown_expires_at = $2, reason = $3 WHERE singleton",
                &[&now, &expires, &reason],
            )
            .await?;
        Ok(())
    }

    pub async fn deactivate(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            *state = KillSwitchState::default();
        }
        metrics::get().kill_switch_active.set(0);
        info!("🟢 kill switch cleared");

        let client = self.db.lock().await;
        client
            .execute(
                "UPDATE kill_switch SET active = FALSE, activated_at = NULL,
                 cooldown_expires_at = NULL, reason = NULL WHERE singleton",
                &[],
            )
            .await?;
        Ok(())
    }
}

// ── Circuit breakers ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct BreakerState {
    api_errors: VecDeque<DateTime<Utc>>,
    consecutive_losses: usize,
    paused_until: Option<DateTime<Utc>>,
    pause_reason: Option<String>,
}

pub struct CircuitBreakers {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Record a venue API error; an error streak pauses trading.
    pub fn record_api_error(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = now - ChronoDuration::seconds(self.config.api_error_window_secs as i64);
        state.api_errors.push_back(now);
        while state.api_errors.front().is_some_and(|t| *t < cutoff) {
            state.api_errors.pop_front();
        }
        if state.api_errors.len() >= self.config.api_error_threshold {
            let until = now + ChronoDuration::seconds(self.config.api_error_pause_secs as i64);
            warn!("🛡️ API error streak: pausing until {until}");
            state.paused_until = Some(until);
            state.pause_reason = Some("api_error_streak".to_string());
            state.api_errors.clear();
        }
    }

    /// Record a closed trade outcome; a loss streak pauses trading.
    pub fn record_outcome(&self, won: bool, now: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if won {
            state.consecutive_losses = 0;
            return;
        }
        state.consecutive_losses += 1;
        if state.consecutive_losses >= self.config.max_consecutive_losses {
            let until = now + ChronoDuration::seconds(self.config.loss_streak_pause_secs as i64);
            warn!(
                "🛡️ {} consecutive losses: pausing until {until}",
                state.consecutive_losses
            );
            state.paused_until = Some(until);
            state.pause_reason = Some("loss_streak".to_string());
            state.consecutive_losses = 0;
        }
    }

    /// Check pause state and position-count limits.
    pub fn check(
        &self,
        open_positions: usize,
        positions_on_symbol: usize,
        now: DateTime<Utc>,
    ) -> Result<(), RiskReject> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(until) = state.paused_until {
            if now < until {
                return Err(RiskReject {
                    guard: "circuit_breaker",
                    detail: format!(
                        "paused ({}) for another {}s",
                        state.pause_reason.as_deref().unwrap_or("unknown"),
                        (until - now).num_seconds()
                    ),
                });
            }
        }
        if open_positions >= self.config.max_concurrent_positions {
            return Err(RiskReject {
                guard: "max_concurrent",
                detail: format!(
                    "{open_positions}/{} concurrent positions",
                    self.config.max_concurrent_positions
                ),
            });
        }
        if positions_on_symbol >= self.config.max_position_per_symbol {
            return Err(RiskReject {
                guard: "per_symbol",
                detail: format!("{positions_on_symbol} open on this symbol"),
            });
        }
        Ok(())
    }
}

// ── Ordered gate walk (pure) ─────────────────────────────────────────────────

/// Evaluate gates 1–7 in order. Everything the walk needs is passed in so
/// the ordering rules are testable without a database or venue.
#[allow(clippy::too_many_arguments)]
pub fn ordered_checks(
    config: &RiskConfig,
    kill_state: &KillSwitchState,
    daily_starting_equity: f64,
    account: &AccountSnapshot,
    proposed_notional: f64,
    breaker_result: Result<(), RiskReject>,
    now: DateTime<Utc>,
) -> GovernorVerdict {
    let mut checks = Vec::new();
    let mut trip_kill_switch = None;

    macro_rules! fail {
        ($guard:expr, $detail:expr) => {{
            let detail: String = $detail;
            checks.push(RiskCheck {
                guard: $guard,
                passed: false,
                detail: detail.clone(),
            });
            return GovernorVerdict {
                checks,
                reject: Some(RiskReject {
                    guard: $guard,
                    detail,
                }),
                trip_kill_switch,
            };
        }};
    }
    macro_rules! pass {
        ($guard:expr, $detail:expr) => {
            checks.push(RiskCheck {
                guard: $guard,
                passed: true,
                detail: $detail,
            })
        };
    }

    // 1. Kill switch.
    if kill_state.blocking(now) {
        fail!(
            "kill_switch",
            format!(
                "kill switch active until {:?}: {}",
                kill_state.cooldown_expires_at,
                kill_state.reason.as_deref().unwrap_or("unspecified")
            )
        );
    }
    pass!("kill_switch", "inactive".to_string());

    // 2. Daily drawdown.
    if daily_starting_equity > 0.0 {
        let drawdown = (account.equity_usd - daily_starting_equity) / daily_starting_equity;
        if drawdown < -config.max_daily_loss_pct {
            let detail = format!(
                "daily drawdown {:.2}% exceeds {:.2}%",
                drawdown * 100.0,
                config.max_daily_loss_pct * 100.0
            );
            trip_kill_switch = Some(detail.clone());
            fail!("daily_drawdown", detail);
        }
        pass!("daily_drawdown", format!("{:.2}% today", drawdown * 100.0));
    }

    // 3. Liquidation distance.
    if account.maintenance_margin_usd > 0.0 {
        let ratio = account.equity_usd / account.maintenance_margin_usd;
        if ratio < config.min_liquidation_ratio {
            fail!(
                "liquidation_distance",
                format!(
                    "equity/maintenance {ratio:.2} below {:.2}",
                    config.min_liquidation_ratio
                )
            );
        }
        pass!("liquidation_distance", format!("ratio {ratio:.2}"));
    }

    // 4. Equity floor.
    if account.equity_usd < config.min_account_value {
        fail!(
            "equity_floor",
            format!(
                "equity ${:.0} below ${:.0}",
                account.equity_usd, config.min_account_value
            )
        );
    }
    pass!("equity_floor", format!("equity ${:.0}", account.equity_usd));

    // 5. Position size cap.
    if account.equity_usd > 0.0 {
        let pct = proposed_notional / account.equity_usd;
        if pct > config.max_position_pct {
            fail!(
                "position_size",
                format!(
                    "proposed {:.2}% of equity exceeds {:.2}%",
                    pct * 100.0,
                    config.max_position_pct * 100.0
                )
            );
        }
        pass!("position_size", format!("{:.2}% of equity", pct * 100.0));
    }

    // 6. Total exposure cap.
    if account.equity_usd > 0.0 {
        let pct = (account.total_notional_usd + proposed_notional) / account.equity_usd;
        if pct > config.max_total_exposure_pct {
            fail!(
                "total_exposure",
                format!(
                    "exposure would reach {:.2}% of equity (cap {:.2}%)",
                    pct * 100.0,
                    config.max_total_exposure_pct * 100.0
                )
            );
        }
        pass!("total_exposure", format!("{:.2}% after entry", pct * 100.0));
    }

    // 7. Circuit breakers.
    if let Err(reject) = breaker_result {
        checks.push(RiskCheck {
            guard: reject.guard,
            passed: false,
            detail: reject.detail.clone(),
        });
        return GovernorVerdict {
            checks,
            reject: Some(reject),
            trip_kill_switch,
        };
    }
    pass!("circuit_breaker", "clear".to_string());

    GovernorVerdict {
        checks,
        reject: None,
        trip_kill_switch,
    }
}

// ── Governor ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct DailyEquity {
    date: Option<NaiveDate>,
    starting_equity: f64,
}

pub struct RiskGovernor {
    pub config: RiskConfig,
    pub kill_switch: Arc<KillSwitch>,
    pub breakers: Arc<CircuitBreakers>,
    daily: Mutex<DailyEquity>,
}

impl RiskGovernor {
    pub fn new(
        config: RiskConfig,
        kill_switch: Arc<KillSwitch>,
        breakers: Arc<CircuitBreakers>,
    ) -> Self {
        Self {
            config,
            kill_switch,
            breakers,
            daily: Mutex::new(DailyEquity::default()),
        }
    }

    /// The first equity observed each UTC day anchors the drawdown gate.
    fn daily_starting_equity(&self, equity_now: f64, now: DateTime<Utc>) -> f64 {
        let mut daily = self.daily.lock().unwrap_or_else(|e| e.into_inner());
        let today = now.date_naive();
        if daily.date != Some(today) {
            daily.date = Some(today);
            daily.starting_equity = equity_now;
        }
        daily.starting_equity
    }

    /// Full ordered evaluation; persists a kill-switch trip when the daily
    /// drawdown gate fires.
    pub async fn evaluate(
        &self,
        account: &AccountSnapshot,
        proposed_notional: f64,
        open_positions: usize,
        positions_on_symbol: usize,
        now: DateTime<Utc>,
    ) -> GovernorVerdict {
        let verdict = ordered_checks(
            &self.config,
            &self.kill_switch.snapshot(),
            self.daily_starting_equity(account.equity_usd, now),
            account,
            proposed_notional,
            self.breakers.check(open_positions, positions_on_symbol, now),
            now,
        );

        if let Some(reason) = &verdict.trip_kill_switch {
            if let Err(e) = self
                .kill_switch
                .activate(reason, self.config.kill_switch_cooldown_hours)
                .await
            {
                warn!("⚠️ failed to persist kill-switch activation: {e:#}");
            }
        }
        if verdict.reject.is_some() {
            metrics::get().risk_rejects.inc();
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cfg() -> RiskConfig {
        RiskConfig {
            max_position_pct: 0.02,
            max_total_exposure_pct: 0.10,
            max_daily_loss_pct: 0.05,
            min_signal_confidence: 0.55,
            max_leverage: 3.0,
            min_account_value: 10_000.0,
            min_liquidation_ratio: 1.5,
            kill_switch_cooldown_hours: 24,
        }
    }

    fn breaker_cfg() -> BreakerConfig {
        BreakerConfig {
            max_concurrent_positions: 3,
            max_position_per_symbol: 1,
            api_error_threshold: 3,
            api_error_window_secs: 60,
            api_error_pause_secs: 300,
            max_consecutive_losses: 5,
            loss_streak_pause_secs: 3_600,
        }
    }

    fn account(equity: f64, maintenance: f64, notional: f64) -> AccountSnapshot {
        AccountSnapshot {
            equity_usd: equity,
            maintenance_margin_usd: maintenance,
            total_notional_usd: notional,
            positions: Vec::new(),
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    fn walk(
        kill: &KillSwitchState,
        start_equity: f64,
        acct: &AccountSnapshot,
        notional: f64,
    ) -> GovernorVerdict {
        ordered_checks(&cfg(), kill, start_equity, acct, notional, Ok(()), t(0))
    }

    #[test]
    fn clean_account_passes_all_gates() {
        let verdict = walk(
            &KillSwitchState::default(),
            100_000.0,
            &account(100_000.0, 10_000.0, 2_000.0),
            1_500.0,
        );
        assert!(verdict.reject.is_none());
        assert!(verdict.checks.iter().all(|c| c.passed));
        assert_eq!(verdict.checks.len(), 7);
    }

    #[test]
    fn kill_switch_blocks_first() {
        let kill = KillSwitchState {
            active: true,
            activated_at: Some(t(0)),
            cooldown_expires_at: Some(t(86_400)),
            reason: Some("daily drawdown".into()),
        };
        let verdict = walk(&kill, 100_000.0, &account(100_000.0, 0.0, 0.0), 100.0);
        assert_eq!(verdict.reject.unwrap().guard, "kill_switch");
        assert_eq!(verdict.checks.len(), 1);
    }

    #[test]
    fn expired_kill_switch_no_longer_blocks() {
        let kill = KillSwitchState {
            active: true,
            activated_at: Some(t(-100_000)),
            cooldown_expires_at: Some(t(-10)),
            reason: Some("old".into()),
        };
        assert!(!kill.blocking(t(0)));
    }

    #[test]
    fn scenario_daily_drawdown_trips_kill_switch() {
        // Start $100k, now $94.9k → -5.1% < -5%.
        let verdict = walk(
            &KillSwitchState::default(),
            100_000.0,
            &account(94_900.0, 1_000.0, 0.0),
            100.0,
        );
        let reject = verdict.reject.unwrap();
        assert_eq!(reject.guard, "daily_drawdown");
        assert!(verdict.trip_kill_switch.is_some());
    }

    #[test]
    fn drawdown_at_exactly_five_percent_passes() {
        let verdict = walk(
            &KillSwitchState::default(),
            100_000.0,
            &account(95_000.0, 1_000.0, 0.0),
            100.0,
        );
        assert!(verdict
            .checks
            .iter()
            .find(|c| c.guard == "daily_drawdown")
            .unwrap()
            .passed);
    }

    #[test]
    fn liquidation_distance_blocks() {
        let verdict = walk(
            &KillSwitchState::default(),
            100_000.0,
            &account(100_000.0, 80_000.0, 0.0),
            100.0,
        );
        assert_eq!(verdict.reject.unwrap().guard, "liquidation_distance");
    }

    #[test]
    fn equity_floor_blocks() {
        let verdict = walk(
            &KillSwitchState::default(),
            9_000.0,
            &account(9_000.0, 100.0, 0.0),
            50.0,
        );
        assert_eq!(verdict.reject.unwrap().guard, "equity_floor");
    }

    #[test]
    fn position_and_exposure_caps_block() {
        // 3% position against a 2% cap.
        let verdict = walk(
            &KillSwitchState::default(),
            100_000.0,
            &account(100_000.0, 1_000.0, 0.0),
            3_000.0,
        );
        assert_eq!(verdict.reject.unwrap().guard, "position_size");

        // 1.5% position but existing 9.5% exposure against a 10% cap.
        let verdict = walk(
            &KillSwitchState::default(),
            100_000.0,
            &account(100_000.0, 1_000.0, 9_500.0),
            1_500.0,
        );
        assert_eq!(verdict.reject.unwrap().guard, "total_exposure");
    }

    #[test]
    fn breaker_api_error_streak_pauses() {
        let b = CircuitBreakers::new(breaker_cfg());
        assert!(b.check(0, 0, t(0)).is_ok());
        b.record_api_error(t(1));
        b.record_api_error(t(2));
        assert!(b.check(0, 0, t(3)).is_ok(), "two errors are not a streak");
        b.record_api_error(t(3));
        let err = b.check(0, 0, t(4)).unwrap_err();
        assert_eq!(err.guard, "circuit_breaker");
        assert!(b.check(0, 0, t(4 + 301)).is_ok());
    }

    #[test]
    fn breaker_errors_outside_window_do_not_trip() {
        let b = CircuitBreakers::new(breaker_cfg());
        b.record_api_error(t(0));
        b.record_api_error(t(100));
        b.record_api_error(t(200));
        assert!(b.check(0, 0, t(201)).is_ok());
    }

    #[test]
    fn breaker_loss_streak_pauses_and_win_resets() {
        let b = CircuitBreakers::new(breaker_cfg());
        for i in 0..4 {
            b.record_outcome(false, t(i));
        }
        b.record_outcome(true, t(5));
        for i in 6..10 {
            b.record_outcome(false, t(i));
        }
        assert!(b.check(0, 0, t(11)).is_ok(), "4 losses after a reset");
        b.record_outcome(false, t(12));
        assert!(b.check(0, 0, t(13)).is_err(), "5th consecutive loss pauses");
    }

    #[test]
    fn breaker_position_limits() {
        let b = CircuitBreakers::new(breaker_cfg());
        assert_eq!(b.check(3, 0, t(0)).unwrap_err().guard, "max_concurrent");
        assert_eq!(b.check(0, 1, t(0)).unwrap_err().guard, "per_symbol");
    }
}
