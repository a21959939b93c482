//! 🧮 Normal-Inverse-Gamma posteriors.
//!
//! Each trader's R-multiple distribution is modeled as
//! `μ|σ² ~ N(m, σ²/κ)`, `σ² ~ InvGamma(α, β)`. Closed episode outcomes
//! drive the conjugate update; the four parameters are computed together
//! before anything is written so a crash can never persist a half-updated
//! posterior.

use anyhow::Result;
use chrono::{DateTime, Utc};
use common::db::Db;
use serde::Serialize;

/// Clamp floor offset keeping κ' > 1, α' > 1, β' > 0.
const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NigPosterior {
    pub m: f64,
    pub kappa: f64,
    pub alpha: f64,
    pub beta: f64,
}

impl NigPosterior {
    /// Prior for a trader with no observed episodes.
    pub fn prior() -> Self {
        Self {
            m: 0.0,
            kappa: 1.0,
            alpha: 3.0,
            beta: 1.0,
        }
    }

    /// Conjugate update with one observed R-multiple.
    ///
    /// κ' = κ + 1
    /// m' = (κ·m + r) / κ'
    /// α' = α + 1/2
    /// β' = β + κ·(r − m)² / (2·κ')
    pub fn update(&self, r: f64) -> Self {
        let kappa_next = self.kappa + 1.0;
        let m_next = (self.kappa * self.m + r) / kappa_next;
        let alpha_next = self.alpha + 0.5;
        let beta_next = self.beta + (self.kappa * (r - self.m).powi(2)) / (2.0 * kappa_next);

        Self {
            m: m_next,
            kappa: kappa_next.max(1.0 + EPS),
            alpha: alpha_next.max(1.0 + EPS),
            beta: beta_next.max(EPS),
        }
    }

    /// Posterior mean of μ.
    pub fn mean(&self) -> f64 {
        self.m
    }

    /// Posterior standard deviation of μ: √(β / (κ·(α−1))).
    pub fn std(&self) -> f64 {
        (self.beta / (self.kappa * (self.alpha - 1.0))).sqrt()
    }

    /// Effective number of observed episodes.
    pub fn effective_n(&self) -> f64 {
        self.kappa - 1.0
    }
}

/// A posterior row with its bookkeeping fields.
#[derive(Debug, Clone, Serialize)]
pub struct TraderPosterior {
    pub address: String,
    pub nig: NigPosterior,
    pub total_signals: i64,
    pub total_pnl_r: f64,
    pub avg_r: f64,
    pub last_update_ts: DateTime<Utc>,
}

/// Load one posterior, or the prior when the trader is unknown.
pub async fn load(db: &Db, address: &str) -> Result<TraderPosterior> {
    let client = db.lock().await;
    let row = client
        .query_opt(
            "SELECT m, kappa, alpha, beta, total_signals, total_pnl_r, avg_r, last_update_ts
             FROM trader_posteriors WHERE address = $1",
            &[&address],
        )
        .await?;

    Ok(match row {
        Some(r) => TraderPosterior {
            address: address.to_string(),
            nig: NigPosterior {
                m: r.get(0),
                kappa: r.get(1),
                alpha: r.get(2),
                beta: r.get(3),
            },
            total_signals: r.get(4),
            total_pnl_r: r.get(5),
            avg_r: r.get(6),
            last_update_ts: r.get(7),
        },
        None => TraderPosterior {
            address: address.to_string(),
            nig: NigPosterior::prior(),
            total_signals: 0,
            total_pnl_r: 0.0,
            avg_r: 0.0,
            last_update_ts: Utc::now(),
        },
    })
}

/// Load every posterior, ordered by address for deterministic iteration.
pub async fn load_all(db: &Db) -> Result<Vec<TraderPosterior>> {
    let client = db.lock().await;
    let rows = client
        .query(
            "SELECT address, m, kappa, alpha, beta, total_signals, total_pnl_r, avg_r, last_update_ts
             FROM trader_posteriors ORDER BY address",
            &[],
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| TraderPosterior {
            address: r.get(0),
            nig: NigPosterior {
                m: r.get(1),
                kappa: r.get(2),
                alpha: r.get(3),
                beta: r.get(4),
            },
            total_signals: r.get(5),
            total_pnl_r: r.get(6),
            avg_r: r.get(7),
            last_update_ts: r.get(8),
        })
        .collect())
}

/// Apply one outcome and persist the updated posterior in a single upsert.
pub async fn apply_outcome(db: &Db, address: &str, r: f64, ts: DateTime<Utc>) -> Result<NigPosterior> {
    let prior = load(db, address).await?;
    let updated = prior.nig.update(r);

    let total_signals = prior.total_signals + 1;
    let total_pnl_r = prior.total_pnl_r + r;
    let avg_r = total_pnl_r / total_signals as f64;

    let client = db.lock().await;
    client
        .execute(
            "INSERT INTO trader_posteriors
               (address, m, kappa, alpha, beta, total_signals, total_pnl_r, avg_r, last_update_ts)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (address) DO UPDATE SET
               m = EXCLUDED.m,
               kappa = EXCLUDED.kappa,
               alpha = EXCLUDED.alpha,
               beta = EXCLUDED.beta,
               total_signals = EXCLUDED.total_signals,
               total_pnl_r = EXCLUDED.total_pnl_r,
               avg_r = EXCLUDED.avg_r,
               last_update_ts = EXCLUDED.last_update_ts",
            &[
                &address,
                &updated.m,
                &updated.kappa,
                &updated.alpha,
                &updated.beta,
                &total_signals,
                &total_pnl_r,
                &avg_r,
                &ts,
            ],
        )
        .await?;

    Ok(updated)
}

/// Make sure a posterior row exists (prior values) without touching an
/// existing one. Used when a candidate first appears.
pub async fn ensure_exists(db: &Db, address: &str) -> Result<()> {
    let prior = NigPosterior::prior();
    let client = db.lock().await;
    client
        .execute(
            "INSERT INTO trader_posteriors
               (address, m, kappa, alpha, beta, total_signals, total_pnl_r, avg_r, last_update_ts)
             VALUES ($1, $2, $3, $4, $5, 0, 0, 0, now())
             ON CONFLICT (address) DO NOTHING",
            &[&address, &prior.m, &prior.kappa, &prior.alpha, &prior.beta],
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prior_matches_spec() {
        let p = NigPosterior::prior();
        assert_eq!((p.m, p.kappa, p.alpha, p.beta), (0.0, 1.0, 3.0, 1.0));
    }

    #[test]
    fn scenario_first_update() {
        // Prior (0, 1, 3, 1), observe r = 1.0 → (0.5, 2, 3.5, 1.25).
        let p = NigPosterior::prior().update(1.0);
        assert!((p.m - 0.5).abs() < 1e-12);
        assert!((p.kappa - 2.0).abs() < 1e-12);
        assert!((p.alpha - 3.5).abs() < 1e-12);
        assert!((p.beta - 1.25).abs() < 1e-12);
    }

    #[test]
    fn update_is_monotone_in_r() {
        // r above the mean pulls the mean up; kappa always grows by one.
        let p = NigPosterior {
            m: 0.2,
            kappa: 5.0,
            alpha: 4.0,
            beta: 2.0,
        };
        let up = p.update(1.0);
        assert!(up.m > p.m);
        assert!((up.kappa - (p.kappa + 1.0)).abs() < 1e-12);

        let down = p.update(-1.0);
        assert!(down.m < p.m);
        assert!((down.kappa - (p.kappa + 1.0)).abs() < 1e-12);
    }

    #[test]
    fn observing_the_mean_leaves_beta_unchanged() {
        let p = NigPosterior {
            m: 0.3,
            kappa: 4.0,
            alpha: 5.0,
            beta: 2.0,
        };
        let up = p.update(0.3);
        assert!((up.m - 0.3).abs() < 1e-12);
        assert!((up.beta - 2.0).abs() < 1e-12);
    }

    #[test]
    fn derived_stats() {
        let p = NigPosterior {
            m: 0.1,
            kappa: 5.0,
            alpha: 3.0,
            beta: 2.0,
        };
        assert_eq!(p.mean(), 0.1);
        assert!((p.std() - (2.0_f64 / (5.0 * 2.0)).sqrt()).abs() < 1e-12);
        assert_eq!(p.effective_n(), 4.0);
    }

    #[test]
    fn variance_grows_with_surprise() {
        let p = NigPosterior::prior();
        let calm = p.update(0.0);
        let shocked = p.update(5.0);
        assert!(shocked.beta > calm.beta);
    }
}
