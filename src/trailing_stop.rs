//! Trailing stop-loss controller.
//!
//! A slow loop scans every configured (bot, pair) for new positions and moves
//! the ones it finds into the fast set; a fast loop follows those positions
//! until they close. Both loops tighten the stop from the entry's tier table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::bybit::api::ApiResponseError;
use crate::api::bybit::client::BybitClient;
use crate::config::{MasterConfig, TierEntry};
use crate::credentials::CredentialBook;
use crate::exchange::{Exchange, Retrying};
use crate::logging::audit_logger::{AuditEvent, AuditLogger};
use crate::model::{EntryKey, PositionSnapshot, Side, TierTable};
use crate::position::{self, PositionError};
use crate::util::round_size;

/// Entries currently followed by the fast loop.
pub type FastSet = Arc<Mutex<HashSet<EntryKey>>>;

/// Stop level suggested by the tier table for `position`, if any tier
/// matches.
pub fn proposed_stop(position: &PositionSnapshot, table: &TierTable) -> Option<f64> {
    let side = position.side?;
    let tier = table.select(position.pnl_percent())?;
    let sign = match side {
        Side::Long => -1.0,
        Side::Short => 1.0,
    };
    Some(position.entry_price * (1.0 + sign * tier.offset / 100.0))
}

/// A stop is only ever tightened: set when none exists, otherwise moved up
/// for a long and down for a short.
pub fn should_apply(side: Side, current: f64, proposed: f64) -> bool {
    if current == 0.0 {
        return true;
    }
    match side {
        Side::Long => proposed > current,
        Side::Short => proposed < current,
    }
}

pub struct MonitoredEntry<E> {
    pub key: EntryKey,
    pub table: TierTable,
    pub exchange: Arc<E>,
}

pub struct StopLossController<E> {
    entries: Vec<MonitoredEntry<E>>,
    fast_set: FastSet,
    audit: AuditLogger,
}

impl<E: Exchange + 'static> StopLossController<E> {
    pub fn new(entries: Vec<MonitoredEntry<E>>, audit: AuditLogger) -> Self {
        Self {
            entries,
            fast_set: Arc::new(Mutex::new(HashSet::new())),
            audit,
        }
    }

    pub fn fast_set(&self) -> FastSet {
        self.fast_set.clone()
    }

    pub fn is_fast(&self, key: &EntryKey) -> bool {
        self.fast_set.lock().contains(key)
    }

    /// Tightens the stop of `position` if its tier asks for it. Returns the
    /// stop that was sent.
    pub async fn evaluate(
        &self,
        entry: &MonitoredEntry<E>,
        symbol: &str,
        position: &PositionSnapshot,
    ) -> Result<Option<f64>, ApiResponseError> {
        let Some(side) = position.side else {
            return Ok(None);
        };
        let pnl = position.pnl_percent();
        let Some(proposed) = proposed_stop(position, &entry.table).map(round_size) else {
            debug!("[STOP_LOSS] {} pnl={:.2}% matches no tier", entry.key, pnl);
            return Ok(None);
        };

        if !should_apply(side, position.stop_loss, proposed) {
            debug!(
                "[STOP_LOSS] {} no need to change stop loss: current={} proposed={}",
                entry.key, position.stop_loss, proposed
            );
            return Ok(None);
        }

        entry.exchange.set_stop_loss(symbol, side, proposed).await?;
        info!(
            "[STOP_LOSS] {} {} entry={} pnl={:.2}% stop {} -> {}",
            entry.key, side, position.entry_price, pnl, position.stop_loss, proposed
        );
        self.audit.log(AuditEvent::StopLossUpdated {
            timestamp: Utc::now(),
            bot_id: entry.key.bot_id.clone(),
            pair: entry.key.pair.clone(),
            previous: position.stop_loss,
            stop_loss: proposed,
            pnl_percent: pnl,
        });
        Ok(Some(proposed))
    }

    async fn check(&self, entry: &MonitoredEntry<E>) -> Result<(String, PositionSnapshot), PositionError> {
        let (market, position) = position::resolve(entry.exchange.as_ref(), &entry.key.pair).await?;
        Ok((market.symbol, position))
    }

    /// One slow-loop pass over the entries not in the fast set.
    pub async fn slow_pass(&self) {
        for entry in &self.entries {
            if self.is_fast(&entry.key) {
                continue;
            }
            debug!("[SLOW_LOOP] Checking {} for {} positions", entry.key.bot_id, entry.key.pair);

            let (symbol, position) = match self.check(entry).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("[SLOW_LOOP] {} position lookup failed: {}", entry.key, e);
                    continue;
                }
            };
            if !position.is_open() {
                continue;
            }

            self.fast_set.lock().insert(entry.key.clone());
            info!("[SLOW_LOOP] {} added to fast set", entry.key);

            if let Err(e) = self.evaluate(entry, &symbol, &position).await {
                error!("[SLOW_LOOP] {} stop loss update failed: {}", entry.key, e);
            }
        }
    }

    /// One fast-loop pass over the fast set.
    pub async fn fast_pass(&self) {
        let members: Vec<EntryKey> = self.fast_set.lock().iter().cloned().collect();
        for entry in self.entries.iter().filter(|e| members.contains(&e.key)) {
            debug!("[FAST_LOOP] Checking {} for {} positions", entry.key.bot_id, entry.key.pair);

            let (symbol, position) = match self.check(entry).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("[FAST_LOOP] {} position lookup failed: {}", entry.key, e);
                    continue;
                }
            };
            if !position.is_open() {
                self.fast_set.lock().remove(&entry.key);
                info!("[FAST_LOOP] {} removed from fast set", entry.key);
                continue;
            }

            if let Err(e) = self.evaluate(entry, &symbol, &position).await {
                error!("[FAST_LOOP] {} stop loss update failed: {}", entry.key, e);
            }
        }
    }

    /// Runs both loops on their own tasks until `token` is cancelled.
    pub async fn run(self: Arc<Self>, slow_delay: Duration, fast_delay: Duration, token: CancellationToken) {
        info!(
            "[STOP_LOSS] Monitoring {} entries (slow={:?}, fast={:?})",
            self.entries.len(),
            slow_delay,
            fast_delay
        );

        let slow = {
            let controller = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    controller.slow_pass().await;
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(slow_delay) => {}
                    }
                }
                info!("[SLOW_LOOP] Stopped");
            })
        };
        let fast = {
            let controller = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    controller.fast_pass().await;
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(fast_delay) => {}
                    }
                }
                info!("[FAST_LOOP] Stopped");
            })
        };

        let (slow_result, fast_result) = tokio::join!(slow, fast);
        if let Err(e) = slow_result {
            error!("[SLOW_LOOP] task panicked: {:?}", e);
        }
        if let Err(e) = fast_result {
            error!("[FAST_LOOP] task panicked: {:?}", e);
        }
    }
}

/// Builds the monitored entries, one exchange client per bot. Entries of
/// bots without credentials are skipped.
pub fn connect_entries(
    master: &MasterConfig,
    credentials: &CredentialBook,
    tiers: Vec<TierEntry>,
) -> Vec<MonitoredEntry<Retrying<BybitClient>>> {
    let mut clients: HashMap<String, Arc<Retrying<BybitClient>>> = HashMap::new();
    let mut entries = Vec::new();

    for tier in tiers {
        let bot_id = tier.key.bot_id.clone();
        let exchange = match clients.get(&bot_id) {
            Some(exchange) => exchange.clone(),
            None => {
                let Some(credential) = credentials.credential(&bot_id) else {
                    warn!("[STOP_LOSS] No credentials for bot {}, skipping {}", bot_id, tier.key);
                    continue;
                };
                let client = match BybitClient::new(
                    credential.clone(),
                    credentials.proxy(&bot_id),
                    master.testnet,
                    master.position_mode(),
                ) {
                    Ok(client) => client,
                    Err(e) => {
                        error!("[STOP_LOSS] Failed to build client for bot {}: {}", bot_id, e);
                        continue;
                    }
                };
                let exchange = Arc::new(Retrying::new(client, master.retry_policy()));
                clients.insert(bot_id, exchange.clone());
                exchange
            }
        };
        if tier.table.is_empty() {
            warn!("[STOP_LOSS] {} has no tiers and will never be adjusted", tier.key);
        }
        entries.push(MonitoredEntry {
            key: tier.key,
            table: tier.table,
            exchange,
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::bybit::auth::ApiCredential;
    use crate::model::Tier;

    fn table() -> TierTable {
        TierTable::new(vec![Tier::new(0.0, 1.0), Tier::new(5.0, 3.0), Tier::new(10.0, 6.0)])
    }

    fn position(side: Side, entry: f64, current: f64, stop: f64) -> PositionSnapshot {
        PositionSnapshot {
            side: Some(side),
            quantity: 1.0,
            stop_loss: stop,
            entry_price: entry,
            current_price: current,
            unrealized_pnl: 0.0,
            leverage: 1.0,
        }
    }

    #[test]
    fn test_proposed_stop_long() {
        // pnl 7% selects (5, 3)
        let stop = proposed_stop(&position(Side::Long, 100.0, 107.0, 0.0), &table()).unwrap();
        assert!((stop - 97.0).abs() < 1e-9);
        // pnl 12% selects (10, 6)
        let stop = proposed_stop(&position(Side::Long, 100.0, 112.0, 0.0), &table()).unwrap();
        assert!((stop - 94.0).abs() < 1e-9);
        assert_eq!(proposed_stop(&position(Side::Long, 100.0, 99.0, 0.0), &table()), None);
    }

    #[test]
    fn test_proposed_stop_short() {
        let stop = proposed_stop(&position(Side::Short, 100.0, 93.0, 0.0), &table()).unwrap();
        assert!((stop - 103.0).abs() < 1e-9);
        assert_eq!(proposed_stop(&PositionSnapshot::flat(100.0), &table()), None);
    }

    #[test]
    fn test_negative_offset_locks_in_profit() {
        let table = TierTable::new(vec![Tier::new(2.0, -1.0)]);
        let stop = proposed_stop(&position(Side::Long, 100.0, 103.0, 0.0), &table).unwrap();
        assert!((stop - 101.0).abs() < 1e-9);
    }

    #[test]
    fn test_should_apply_only_tightens() {
        assert!(should_apply(Side::Long, 0.0, 90.0));
        assert!(should_apply(Side::Long, 95.0, 97.0));
        assert!(!should_apply(Side::Long, 97.0, 97.0));
        assert!(!should_apply(Side::Long, 97.0, 94.0));

        assert!(should_apply(Side::Short, 0.0, 110.0));
        assert!(should_apply(Side::Short, 105.0, 103.0));
        assert!(!should_apply(Side::Short, 103.0, 106.0));
    }

    #[test]
    fn test_connect_entries_skips_bots_without_credentials() {
        let credentials = CredentialBook::from_readers(
            "botid,key,secret\n1,k,s\n".as_bytes(),
            None::<&[u8]>,
        )
        .unwrap();
        let tiers = vec![
            TierEntry {
                key: EntryKey::new("1", "BTCUSDT"),
                table: table(),
            },
            TierEntry {
                key: EntryKey::new("1", "ETHUSDT"),
                table: table(),
            },
            TierEntry {
                key: EntryKey::new("2", "BTCUSDT"),
                table: table(),
            },
        ];
        let entries = connect_entries(&MasterConfig::default(), &credentials, tiers);
        assert_eq!(entries.len(), 2);
        assert!(Arc::ptr_eq(&entries[0].exchange, &entries[1].exchange));
        assert_eq!(
            entries[0].exchange.inner().session().credential,
            ApiCredential::new("k", "s")
        );
    }
}
