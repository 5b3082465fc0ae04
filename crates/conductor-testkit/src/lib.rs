//! conductor-testkit
//!
//! Deterministic fakes for `InstanceDriver` and `SqlConnector`, used by the
//! scenario tests in `conductor-backend` and `conductor-daemon` so they
//! never touch a real cloud provider or database.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use conductor_provider::{Instance, InstanceDriver, InstanceState, ProviderError, UnnamedInstance};
use conductor_sql::{MapiUrl, QueryRows, SqlConnector, SqlError};

#[derive(Default)]
pub struct FakeInstanceDriver {
    instances: Mutex<HashMap<String, Instance>>,
    tags: Mutex<HashMap<String, BTreeMap<String, String>>>,
    start_calls: Mutex<Vec<String>>,
    stop_calls: Mutex<Vec<String>>,
}

impl FakeInstanceDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, instance: Instance) {
        self.instances.lock().unwrap().insert(instance.id.clone(), instance);
    }

    /// Seed an instance along with the provider tags `list_by_tags` filters
    /// on, for tests that exercise discovery rather than constructing a
    /// `Pool` directly from a fixed `Vec<Minion>`.
    pub fn seed_with_tags(&self, instance: Instance, tags: BTreeMap<String, String>) {
        self.tags.lock().unwrap().insert(instance.id.clone(), tags);
        self.instances.lock().unwrap().insert(instance.id.clone(), instance);
    }

    pub fn set_state(&self, id: &str, state: InstanceState) {
        if let Some(inst) = self.instances.lock().unwrap().get_mut(id) {
            inst.state = state;
        }
    }

    pub fn start_calls(&self) -> Vec<String> {
        self.start_calls.lock().unwrap().clone()
    }

    pub fn stop_calls(&self) -> Vec<String> {
        self.stop_calls.lock().unwrap().clone()
    }
}

impl InstanceDriver for FakeInstanceDriver {
    /// Instances seeded via plain `seed()` (no tags recorded) match every
    /// filter, same as an empty filter would against a real provider;
    /// instances seeded via `seed_with_tags` must match all requested pairs.
    fn list_by_tags(&self, tags: &BTreeMap<String, String>) -> Result<Vec<Instance>, UnnamedInstance> {
        let seeded_tags = self.tags.lock().unwrap();
        let mut matches: Vec<Instance> = self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|inst| match seeded_tags.get(&inst.id) {
                Some(inst_tags) => tags.iter().all(|(k, v)| inst_tags.get(k) == Some(v)),
                None => true,
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(matches)
    }

    fn describe(&self, instance_id: &str) -> Result<Instance, ProviderError> {
        self.instances
            .lock()
            .unwrap()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| ProviderError {
                instance_id: instance_id.to_string(),
                message: "unknown instance id".to_string(),
            })
    }

    fn start(&self, instance_id: &str) -> Result<(), ProviderError> {
        self.start_calls.lock().unwrap().push(instance_id.to_string());
        self.set_state(instance_id, InstanceState::Pending);
        Ok(())
    }

    fn stop(&self, instance_id: &str) -> Result<(), ProviderError> {
        self.stop_calls.lock().unwrap().push(instance_id.to_string());
        self.set_state(instance_id, InstanceState::Stopping);
        Ok(())
    }
}

/// A connector that serves canned EXPLAIN output and row fixtures instead of
/// talking to a real database.
pub struct FakeSqlConnector {
    url: MapiUrl,
    explain_text: String,
    rows: QueryRows,
    queries: Mutex<Vec<String>>,
}

impl FakeSqlConnector {
    pub fn new(url: MapiUrl) -> Self {
        Self {
            url,
            explain_text: String::new(),
            rows: Vec::new(),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn with_explain(mut self, text: impl Into<String>) -> Self {
        self.explain_text = text.into();
        self
    }

    pub fn with_rows(mut self, rows: QueryRows) -> Self {
        self.rows = rows;
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

impl SqlConnector for FakeSqlConnector {
    fn url(&self) -> &MapiUrl {
        &self.url
    }

    fn execute(&self, query: &str) -> Result<QueryRows, SqlError> {
        self.queries.lock().unwrap().push(query.to_string());
        if query.trim_start().to_ascii_lowercase().starts_with("explain") {
            Ok(self
                .explain_text
                .lines()
                .map(|line| vec![serde_json::Value::String(line.to_string())])
                .collect())
        } else {
            Ok(self.rows.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_driver_records_start_and_stop() {
        let driver = FakeInstanceDriver::new();
        driver.seed(Instance {
            id: "i-1".into(),
            name: "m1".into(),
            state: InstanceState::Stopped,
            private_ip: None,
        });
        driver.start("i-1").unwrap();
        assert_eq!(driver.start_calls(), vec!["i-1".to_string()]);
        assert_eq!(driver.describe("i-1").unwrap().state, InstanceState::Pending);
    }

    #[test]
    fn fake_sql_connector_returns_explain_lines_for_explain_query() {
        let url = MapiUrl::parse("mapi:monetdb://HOSTNAME/demo").unwrap();
        let conn = FakeSqlConnector::new(url).with_explain("line one\nline two\n");
        let rows = conn.execute("explain select 1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(conn.queries(), vec!["explain select 1".to_string()]);
    }

    #[test]
    fn fake_sql_connector_returns_rows_for_plain_query() {
        let url = MapiUrl::parse("mapi:monetdb://HOSTNAME/demo").unwrap();
        let conn = FakeSqlConnector::new(url)
            .with_rows(vec![vec![serde_json::Value::from(1)]]);
        let rows = conn.execute("select 1").unwrap();
        assert_eq!(rows, vec![vec![serde_json::Value::from(1)]]);
    }

    #[tokio::test]
    async fn discover_filters_by_tags_and_sorts_by_name() {
        use std::sync::Arc;

        let driver = Arc::new(FakeInstanceDriver::new());
        driver.seed_with_tags(
            Instance {
                id: "i-2".into(),
                name: "b".into(),
                state: InstanceState::Stopped,
                private_ip: None,
            },
            BTreeMap::from([("size".to_string(), "small".to_string())]),
        );
        driver.seed_with_tags(
            Instance {
                id: "i-1".into(),
                name: "a".into(),
                state: InstanceState::Stopped,
                private_ip: None,
            },
            BTreeMap::from([("size".to_string(), "small".to_string())]),
        );
        driver.seed_with_tags(
            Instance {
                id: "i-3".into(),
                name: "c".into(),
                state: InstanceState::Stopped,
                private_ip: None,
            },
            BTreeMap::from([("size".to_string(), "large".to_string())]),
        );

        let tags = BTreeMap::from([("size".to_string(), "small".to_string())]);
        let minions = conductor_minion::discover(driver, &tags).unwrap();
        assert_eq!(minions.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
