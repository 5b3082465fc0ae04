//! Long-poll status distribution: a generation-counted snapshot that
//! clients can block on until it changes, coalesced so that cosmetic churn
//! (unchanged rendered text) does not wake every sleeper more than once a
//! minute.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

const COALESCE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PoolStats {
    pub load: f64,
    pub up: usize,
    pub starting: usize,
    pub actual: usize,
    pub desired: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub stats: BTreeMap<String, PoolStats>,
    pub text: String,
}

struct HubState {
    id: String,
    generation: u64,
    last_update: Instant,
    status: StatusSnapshot,
}

/// Mirrors the original's `PollHub`: one id per process lifetime, a
/// monotonically increasing generation, and `get_state` blocking until
/// either the caller's remembered `id` no longer matches (hub restarted) or
/// a newer generation than `seen` is available.
pub struct StatusHub {
    state: Mutex<HubState>,
    notify: Notify,
}

impl StatusHub {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(HubState {
                id: id.into(),
                generation: 1,
                last_update: Instant::now() - COALESCE_WINDOW,
                status: StatusSnapshot::default(),
            }),
            notify: Notify::new(),
        }
    }

    /// Publish a new snapshot. A no-op if less than a minute has passed
    /// since the last update and the rendered text hasn't changed — stats
    /// alone churning too fast would otherwise wake every long-poller every
    /// tick.
    pub fn set_state(&self, new_status: StatusSnapshot) {
        let mut st = self.state.lock().unwrap();
        let now = Instant::now();
        if now.duration_since(st.last_update) < COALESCE_WINDOW && new_status.text == st.status.text {
            return;
        }
        st.status = new_status;
        st.last_update = now;
        st.generation += 1;
        drop(st);
        self.notify.notify_waiters();
    }

    /// Block until a fresher snapshot is available relative to `(id, seen)`.
    pub async fn get_state(&self, id: Option<&str>, seen: u64) -> (String, u64, StatusSnapshot) {
        loop {
            let notified = self.notify.notified();
            {
                let st = self.state.lock().unwrap();
                let seen = seen.min(st.generation);
                if id != Some(st.id.as_str()) || seen < st.generation {
                    return (st.id.clone(), st.generation, st.status.clone());
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_call_returns_immediately_regardless_of_seen() {
        let hub = StatusHub::new("hub-1");
        let (id, gen, _) = hub.get_state(None, 0).await;
        assert_eq!(id, "hub-1");
        assert_eq!(gen, 1);
    }

    #[tokio::test]
    async fn same_id_and_generation_blocks_until_update() {
        let hub = std::sync::Arc::new(StatusHub::new("hub-1"));
        let (id, gen, _) = hub.get_state(None, 0).await;

        let waiter = tokio::spawn({
            let hub = hub.clone();
            let id = id.clone();
            async move { hub.get_state(Some(&id), gen).await }
        });

        // Give the waiter a chance to block before publishing.
        tokio::task::yield_now().await;

        hub.set_state(StatusSnapshot {
            text: "changed".into(),
            ..Default::default()
        });

        let (id2, gen2, snap) = waiter.await.unwrap();
        assert_eq!(id2, id);
        assert!(gen2 > gen);
        assert_eq!(snap.text, "changed");
    }

    #[test]
    fn coalesces_identical_text_within_window() {
        let hub = StatusHub::new("hub-1");
        hub.set_state(StatusSnapshot {
            text: "same".into(),
            ..Default::default()
        });
        let gen_after_first = hub.state.lock().unwrap().generation;

        hub.set_state(StatusSnapshot {
            text: "same".into(),
            stats: BTreeMap::from([(
                "POOL".to_string(),
                PoolStats {
                    load: 3.0,
                    ..Default::default()
                },
            )]),
        });
        let gen_after_second = hub.state.lock().unwrap().generation;

        assert_eq!(gen_after_first, gen_after_second, "unchanged text within the window must not bump generation");
    }
}
