//! Process-wide orchestrator: owns every pool, the query advisor pipeline,
//! the blocking-claim condition, and the status hub. See `conductor-pool`
//! for per-pool mechanics and `conductor-minion` for per-VM mechanics.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conductor_pool::{Claim, Pool};
use conductor_sql::{connector_for_ip, MapiUrl, SqlConnector};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::ConductorError;
use crate::status::{PoolStats, StatusHub, StatusSnapshot};

const MAX_SLEEPERS: u32 = 100;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Factory producing a fresh `SqlConnector` bound to a resolved MAPI URL.
/// Production wiring supplies a real MAPI client here; tests supply one
/// that returns a pre-seeded `FakeSqlConnector` regardless of the URL.
pub type ConnectorFactory = dyn Fn(MapiUrl) -> Arc<dyn SqlConnector> + Send + Sync;

pub struct Backend {
    pools: BTreeMap<String, Arc<Pool>>,
    specs: BTreeMap<String, u64>,
    triggers: Mutex<HashMap<String, i64>>,
    sleepers: Mutex<u32>,
    condition: Notify,
    storage: tokio::sync::Mutex<Option<conductor_advisor::Storage>>,
    explainer: Arc<dyn SqlConnector>,
    minion_connector_template: MapiUrl,
    connector_factory: Arc<ConnectorFactory>,
    status_hub: StatusHub,
}

pub struct QueryResult {
    pub query: String,
    pub advice: String,
    pub ip: String,
    pub url: String,
    pub rows: conductor_sql::QueryRows,
}

impl Backend {
    /// `specs` must have exactly the same key set as `pools` (one entry per
    /// pool, its per-node memory in bytes).
    pub fn new(
        pools: BTreeMap<String, Arc<Pool>>,
        specs: BTreeMap<String, u64>,
        explainer: Arc<dyn SqlConnector>,
        minion_connector_template: MapiUrl,
        connector_factory: Arc<ConnectorFactory>,
    ) -> anyhow::Result<Arc<Self>> {
        anyhow::ensure!(!pools.is_empty(), "backend requires at least one pool");
        anyhow::ensure!(
            pools.keys().collect::<std::collections::BTreeSet<_>>()
                == specs.keys().collect::<std::collections::BTreeSet<_>>(),
            "pool specs must cover exactly the configured pools"
        );

        let hub_id = uuid::Uuid::new_v4().to_string();
        let backend = Arc::new(Self {
            pools,
            specs,
            triggers: Mutex::new(HashMap::new()),
            sleepers: Mutex::new(0),
            condition: Notify::new(),
            storage: tokio::sync::Mutex::new(None),
            explainer,
            minion_connector_template,
            connector_factory,
            status_hub: StatusHub::new(hub_id),
        });
        backend.update_status();
        Ok(backend)
    }

    pub fn pools(&self) -> &BTreeMap<String, Arc<Pool>> {
        &self.pools
    }

    /// Start the 1 Hz polling task. The caller retains the handle only to
    /// await/abort it on shutdown; the task never returns on its own.
    pub fn spawn_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let backend = Arc::clone(self);
        tokio::spawn(async move { backend.polling_loop().await })
    }

    async fn polling_loop(self: Arc<Self>) {
        let mut last_messages: HashMap<String, String> = HashMap::new();
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            let mut changed = false;
            for (name, pool) in &self.pools {
                pool.poll().await;
                self.manage_pool_size(pool);

                let msg = format!(
                    "Pool {name}: {} members, {} up, {} desired, load {:.1}",
                    pool.len(),
                    pool.actual(),
                    pool.desired(),
                    pool.load()
                );
                if last_messages.get(name) != Some(&msg) {
                    tracing::info!("{msg}");
                    changed = true;
                }
                last_messages.insert(name.clone(), msg);
            }
            self.update_shrink_hysteresis();
            if changed {
                self.condition.notify_waiters();
            }
            self.update_status();
        }
    }

    /// Recompute one pool's desired size from its load average, with a
    /// startup floor (don't shut everything down before load has had a
    /// chance to appear) and a triggered-revive escape hatch (don't stay at
    /// zero forever if someone is actively waiting for a claim).
    fn manage_pool_size(&self, pool: &Arc<Pool>) {
        let load = pool.load();
        let ups = pool.classify().up.len();

        let mut new_desired = load.ceil() as i64;
        let mut reason = "load";

        let minutes_running = pool.time_running().as_secs_f64() / 60.0;
        let bottom = (ups as i64 - minutes_running.floor() as i64).max(0);
        if new_desired < bottom {
            new_desired = bottom;
            reason = "keep some running initially";
        }

        if bottom == 0
            && new_desired == 1
            && pool.time_since_change() > Duration::from_secs(15 * 60)
            && load < 0.1
        {
            new_desired = 0;
            reason = "no recent activity";
        }

        let triggered = self.triggers.lock().unwrap().get(&pool.name).copied().unwrap_or(0) > 0;
        if new_desired == 0 && triggered {
            new_desired = 1;
            reason = "triggered";
        }

        let new_desired = (new_desired.max(0) as usize).min(pool.len());
        if new_desired != pool.desired() {
            tracing::info!(
                pool = %pool.name,
                load = %format!("{load:.1}"),
                from = pool.desired(),
                to = new_desired,
                reason,
                "resizing pool"
            );
        }
        pool.set_desired(new_desired);
    }

    /// A pool may only shrink its last members while every other pool has
    /// already caught up to its own desired size; otherwise a pool that
    /// just drained to free capacity for a peer would immediately start
    /// shrinking itself too, and the two would thrash forever. Called once
    /// per tick from `polling_loop`; exposed so tests can drive it without
    /// waiting out a real poll interval.
    pub fn update_shrink_hysteresis(&self) {
        for (name, pool) in &self.pools {
            let others_caught_up = self
                .pools
                .iter()
                .filter(|(other_name, _)| *other_name != name)
                .all(|(_, other)| other.actual() >= other.desired());
            pool.set_shrink_allowed(others_caught_up);
        }
    }

    /// Claim from `pool`, blocking (and counting as a "trigger" that biases
    /// `manage_pool_size` toward reviving the pool) until one frees up.
    pub async fn wait_for_pool(&self, pool: &Arc<Pool>) -> Result<Claim, ConductorError> {
        if let Some(c) = pool.claim().await {
            return Ok(c);
        }

        {
            let mut sleepers = self.sleepers.lock().unwrap();
            if *sleepers >= MAX_SLEEPERS {
                return Err(ConductorError::Overload);
            }
            *sleepers += 1;
        }
        *self.triggers.lock().unwrap().entry(pool.name.clone()).or_insert(0) += 1;

        let result = loop {
            let notified = self.condition.notified();
            if let Some(c) = pool.claim().await {
                break c;
            }
            notified.await;
        };

        *self.sleepers.lock().unwrap() -= 1;
        if let Some(count) = self.triggers.lock().unwrap().get_mut(&pool.name) {
            *count -= 1;
        }

        Ok(result)
    }

    /// Claim from any pool without blocking; if every pool is saturated,
    /// fall back to blocking on the first configured pool.
    pub async fn claim_any_pool(&self) -> Result<Claim, ConductorError> {
        for pool in self.pools.values() {
            if let Some(c) = pool.claim().await {
                return Ok(c);
            }
        }
        let first = self.pools.values().next().expect("backend always has at least one pool");
        self.wait_for_pool(first).await
    }

    fn connector_for_claim(&self, ip: &str) -> Result<Arc<dyn SqlConnector>, ConductorError> {
        let resolved = connector_for_ip(&self.minion_connector_template, ip)?;
        Ok((self.connector_factory)(resolved))
    }

    /// Lazily probe and cache the storage catalog for the lifetime of this
    /// backend, using whichever minion is first available.
    pub async fn get_storage(&self) -> Result<conductor_advisor::Storage, ConductorError> {
        let mut cached = self.storage.lock().await;
        if let Some(storage) = &*cached {
            return Ok(storage.clone());
        }

        let claim = self.claim_any_pool().await?;
        let ip = claim.ip.clone().ok_or_else(|| {
            ConductorError::ClientError(500, "claimed minion has no address".to_string())
        })?;
        let conn = self.connector_for_claim(&ip)?;
        let rows = conn.execute(STORAGE_PROBE_QUERY)?;

        let mut storage = conductor_advisor::Storage::new();
        for row in rows {
            if row.len() < 4 {
                continue;
            }
            let schema = row[0].as_str().unwrap_or_default();
            let table = row[1].as_str().unwrap_or_default();
            let column = row[2].as_str().unwrap_or_default();
            let size = row[3].as_u64().unwrap_or(0);
            storage.set_colsize(schema, table, column, size);
        }

        *cached = Some(storage.clone());
        tracing::info!("successfully retrieved storage stats");
        Ok(storage)
    }

    pub async fn execute_query(&self, query: &str) -> Result<QueryResult, ConductorError> {
        let storage = self.get_storage().await?;

        let explain_rows = self.explainer.execute(&format!("explain {query}"))?;
        let explain_text: String = explain_rows
            .iter()
            .filter_map(|row| row.first())
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let advice = conductor_advisor::advise(&explain_text, &storage, &self.specs)
            .map_err(|e| ConductorError::ClientError(500, e.to_string()))?;

        let pool = self
            .pools
            .get(&advice)
            .expect("advise() only returns configured pool names");

        let claim = self.wait_for_pool(pool).await?;
        let ip = claim
            .ip
            .clone()
            .ok_or_else(|| ConductorError::ClientError(500, "claimed minion has no address".to_string()))?;
        let conn = self.connector_for_claim(&ip)?;
        let rows = conn.execute(query)?;

        Ok(QueryResult {
            query: query.to_string(),
            advice,
            url: conn.url().to_url_string(),
            ip,
            rows,
        })
    }

    pub fn set_pool_size(&self, poolname: &str, size: i64) -> Result<(), ConductorError> {
        if size < 0 {
            return Err(ConductorError::ClientError(400, "size must be >= 0".to_string()));
        }
        let Some(pool) = self.pools.get(poolname) else {
            let known = self.pools.keys().cloned().collect::<Vec<_>>().join(", ");
            return Err(ConductorError::ClientError(
                404,
                format!("pool {poolname} not found, try one of {known}"),
            ));
        };
        tracing::info!(pool = %poolname, size, "set desired pool size");
        pool.set_desired(size as usize);
        Ok(())
    }

    pub async fn status(&self, id: Option<&str>, seen: u64) -> (String, u64, StatusSnapshot) {
        self.status_hub.get_state(id, seen).await
    }

    fn update_status(&self) {
        let mut text = String::new();
        let mut stats = BTreeMap::new();

        for pool in self.pools.values() {
            use std::fmt::Write;
            let suffix = if pool.postpone_shrink() { ", postponing shrinks" } else { "" };
            let _ = writeln!(
                text,
                "Pool {}, load={:.1}, actual={}, desired={}{}:",
                pool.name,
                pool.load(),
                pool.actual(),
                pool.desired(),
                suffix
            );

            let classification = pool.classify();
            stats.insert(
                pool.name.clone(),
                PoolStats {
                    load: pool.load(),
                    up: classification.up.len(),
                    starting: classification.starting.len(),
                    actual: pool.actual(),
                    desired: pool.desired(),
                },
            );
            text.push('\n');
        }

        self.status_hub.set_state(StatusSnapshot { stats, text });
    }
}

const STORAGE_PROBE_QUERY: &str =
    "SELECT schema, table, column, columnsize + heapsize + hashes + imprints + orderidx AS colsize FROM sys.storage()";
