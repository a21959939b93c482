//! 🔗 Pairwise trader correlations.
//!
//! Daily job: for each pool address, bucket the last 30 days of fills into
//! 5-minute intervals and keep only the sign of the net position change in
//! each bucket. For every pair with at least 10 common non-zero buckets,
//! the φ correlation of those signs is upserted (negatives clipped to 0 —
//! anti-correlated traders do not make consensus more independent than
//! uncorrelated ones).

use anyhow::Result;
use chrono::Utc;
use common::db::Db;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::JobConfig;
use crate::metrics;

pub const BUCKET_SECS: i64 = 300;

/// Bucket index → sign of net position change (buys − sells) in the bucket.
pub fn sign_buckets(fills: &[(i64, f64)]) -> HashMap<i64, i8> {
    let mut net: HashMap<i64, f64> = HashMap::new();
    for (ts_secs, signed_size) in fills {
        *net.entry(ts_secs / BUCKET_SECS).or_insert(0.0) += signed_size;
    }
    net.into_iter()
        .filter_map(|(bucket, sum)| {
            if sum > f64::EPSILON {
                Some((bucket, 1i8))
            } else if sum < -f64::EPSILON {
                Some((bucket, -1i8))
            } else {
                None
            }
        })
        .collect()
}

/// Common non-zero buckets between two sign vectors.
pub fn common_buckets(a: &HashMap<i64, i8>, b: &HashMap<i64, i8>) -> Vec<(i8, i8)> {
    a.iter()
        .filter_map(|(bucket, sa)| b.get(bucket).map(|sb| (*sa, *sb)))
        .collect()
}

/// Pearson correlation of the paired signs (φ for ±1 variables).
pub fn phi(pairs: &[(i8, i8)]) -> Option<f64> {
    let n = pairs.len();
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let (mut sum_a, mut sum_b, mut sum_ab, mut sum_a2, mut sum_b2) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (a, b) in pairs {
        let (a, b) = (*a as f64, *b as f64);
        sum_a += a;
        sum_b += b;
        sum_ab += a * b;
        sum_a2 += a * a;
        sum_b2 += b * b;
    }
    let cov = sum_ab / nf - (sum_a / nf) * (sum_b / nf);
    let var_a = sum_a2 / nf - (sum_a / nf).powi(2);
    let var_b = sum_b2 / nf - (sum_b / nf).powi(2);
    if var_a <= 0.0 || var_b <= 0.0 {
        // A trader who only ever trades one direction carries no pairwise
        // information; callers fall back to the default ρ.
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

pub struct CorrelationJob {
    db: Arc<Db>,
    config: JobConfig,
}

impl CorrelationJob {
    pub fn new(db: Arc<Db>, config: JobConfig) -> Self {
        Self { db, config }
    }

    /// Compute and upsert today's correlation matrix for the pool.
    pub async fn run_once(&self) -> Result<usize> {
        let window_days = self.config.corr_window_days;

        // Signed fills for pool members over the window.
        let rows = {
            let client = self.db.lock().await;
            client
                .query(
                    &format!(
                        "SELECT f.address,
                                EXTRACT(EPOCH FROM f.ts)::BIGINT,
                                CASE WHEN f.side = 'buy' THEN f.size ELSE -f.size END
                         FROM fills f
                         JOIN alpha_pool p ON p.address = f.address AND p.is_active
                         WHERE f.ts > now() - INTERVAL '{window_days} days'"
                    ),
                    &[],
                )
                .await?
        };

        let mut per_address: HashMap<String, Vec<(i64, f64)>> = HashMap::new();
        for row in rows {
            let address: String = row.get(0);
            let ts: i64 = row.get(1);
            let signed: f64 = row.get(2);
            per_address.entry(address).or_default().push((ts, signed));
        }

        let vectors: Vec<(String, HashMap<i64, i8>)> = {
            let mut v: Vec<_> = per_address
                .into_iter()
                .map(|(addr, fills)| (addr, sign_buckets(&fills)))
                .collect();
            v.sort_by(|a, b| a.0.cmp(&b.0));
            v
        };

        let as_of = Utc::now().date_naive();
        let mut written = 0usize;

        for i in 0..vectors.len() {
            for j in (i + 1)..vectors.len() {
                let (addr_a, vec_a) = &vectors[i];
                let (addr_b, vec_b) = &vectors[j];

                let pairs = common_buckets(vec_a, vec_b);
                if pairs.len() < self.config.corr_min_common_buckets {
                    continue;
                }
                let Some(raw_rho) = phi(&pairs) else {
                    continue;
                };
                let rho = raw_rho.max(0.0);

                let client = self.db.lock().await;
                if let Err(e) = client
                    .execute(
                        "INSERT INTO trader_correlations
                           (as_of_date, addr_a, addr_b, rho, n_common_buckets)
                         VALUES ($1, $2, $3, $4, $5)
                         ON CONFLICT (as_of_date, addr_a, addr_b)
                         DO UPDATE SET rho = EXCLUDED.rho,
                                       n_common_buckets = EXCLUDED.n_common_buckets",
                        &[&as_of, addr_a, addr_b, &rho, &(pairs.len() as i32)],
                    )
                    .await
                {
                    warn!("⚠️ correlation upsert failed for {addr_a}/{addr_b}: {e}");
                    continue;
                }
                metrics::get().correlations_written.inc();
                written += 1;
            }
        }

        info!("🔗 correlation job: {written} pairs written for {as_of}");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_sum_and_sign() {
        let fills = vec![
            (0, 1.0),
            (100, -0.4), // same bucket, net +0.6
            (300, -2.0), // next bucket, net -2
            (600, 1.0),
            (650, -1.0), // nets to zero → dropped
        ];
        let buckets = sign_buckets(&fills);
        assert_eq!(buckets.get(&0), Some(&1));
        assert_eq!(buckets.get(&1), Some(&-1));
        assert_eq!(buckets.get(&2), None);
    }

    #[test]
    fn identical_traders_have_phi_one() {
        let pairs: Vec<(i8, i8)> = vec![(1, 1), (-1, -1), (1, 1), (-1, -1), (1, 1)];
        let rho = phi(&pairs).unwrap();
        assert!((rho - 1.0).abs() < 1e-9);
    }

    #[test]
    fn opposite_traders_have_phi_minus_one() {
        let pairs: Vec<(i8, i8)> = vec![(1, -1), (-1, 1), (1, -1), (-1, 1)];
        let rho = phi(&pairs).unwrap();
        assert!((rho + 1.0).abs() < 1e-9);
        // The job clips this to zero before storing.
        assert_eq!(rho.max(0.0), 0.0);
    }

    #[test]
    fn one_sided_trader_yields_none() {
        let pairs: Vec<(i8, i8)> = vec![(1, 1), (1, -1), (1, 1)];
        assert!(phi(&pairs).is_none());
    }

    #[test]
    fn uncorrelated_mix_is_near_zero() {
        let pairs: Vec<(i8, i8)> = vec![(1, 1), (1, -1), (-1, 1), (-1, -1)];
        let rho = phi(&pairs).unwrap();
        assert!(rho.abs() < 1e-9);
    }

    #[test]
    fn common_buckets_intersects() {
        let mut a = HashMap::new();
        a.insert(1, 1i8);
        a.insert(2, -1i8);
        let mut b = HashMap::new();
        b.insert(2, 1i8);
        b.insert(3, 1i8);
        let common = common_buckets(&a, &b);
        assert_eq!(common, vec![(-1, 1)]);
    }
}
