//! conductor-minion
//!
//! Per-VM lifecycle: reconcile observed vs desired instance state, throttle
//! retries, and promote RUNNING to READY once the database port answers.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use conductor_provider::{Instance, InstanceDriver, InstanceState, UnnamedInstance};
use conductor_rules::{Rule, RuleEngine};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// What a `Minion::poll` tick does to move observed state toward desired
/// state: invoke the provider to start/stop, or simply wait out an
/// in-progress transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Wait,
}

const RETRY_THROTTLE: Duration = Duration::from_secs(60);
const DB_PORT: u16 = 50000;
const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

fn engine() -> &'static RuleEngine<InstanceState, Action> {
    static ENGINE: OnceLock<RuleEngine<InstanceState, Action>> = OnceLock::new();
    ENGINE.get_or_init(|| {
        use InstanceState::*;
        RuleEngine::new(vec![
            Rule::new(vec![Stopped], Pending, Action::Start),
            Rule::new(vec![Pending], Running, Action::Wait),
            Rule::new(vec![Running], Ready, Action::Wait),
            Rule::new(vec![Running, Ready], ShuttingDown, Action::Stop),
            Rule::new(vec![ShuttingDown], Terminated, Action::Wait),
            Rule::new(vec![Running, Ready], Stopping, Action::Stop),
            Rule::new(vec![Stopping], Stopped, Action::Wait),
        ])
    })
}

/// Identity, back-reference to the provider, and the retry-throttle
/// quadruple for one worker VM.
pub struct Minion {
    pub name: String,
    pub id: Option<String>,
    driver: Arc<dyn InstanceDriver>,

    private_ip: Option<String>,
    pub observed_state: InstanceState,
    pub desired_state: Option<InstanceState>,
    last_action: Option<Action>,
    last_action_state: Option<InstanceState>,
    last_action_time: Option<Instant>,
}

impl Minion {
    /// Construct a minion record. `observed_state` starts at `NONEXISTENT`
    /// until the first `refresh()`.
    pub fn new(name: impl Into<String>, id: Option<String>, driver: Arc<dyn InstanceDriver>) -> Self {
        Self {
            name: name.into(),
            id,
            driver,
            private_ip: None,
            observed_state: InstanceState::Nonexistent,
            desired_state: None,
            last_action: None,
            last_action_state: None,
            last_action_time: None,
        }
    }

    pub fn ip(&self) -> Option<&str> {
        self.private_ip.as_deref()
    }

    /// Query the provider for the instance state; if RUNNING, attempt a
    /// 1-second TCP connect to the database port and promote to READY on
    /// success. Connection refused or timeout leaves state at RUNNING.
    pub async fn refresh(&mut self) {
        let Some(id) = self.id.clone() else {
            self.observed_state = InstanceState::Nonexistent;
            return;
        };

        match self.driver.describe(&id) {
            Ok(Instance {
                state, private_ip, ..
            }) => {
                self.private_ip = private_ip;
                let mut state = state;
                if state == InstanceState::Running && self.pings().await {
                    state = InstanceState::Ready;
                }
                self.observed_state = state;
            }
            Err(err) => {
                tracing::warn!(minion = %self.name, %err, "refresh failed, keeping last observed state");
            }
        }
    }

    async fn pings(&self) -> bool {
        let Some(ip) = &self.private_ip else {
            return false;
        };
        match timeout(TCP_PROBE_TIMEOUT, TcpStream::connect((ip.as_str(), DB_PORT))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(_)) | Err(_) => false,
        }
    }

    /// Record a new desired state if the rule engine can plan a path to it
    /// from the current observed state (or it's already there).
    pub fn make(&mut self, desired: InstanceState) -> bool {
        if self.observed_state == desired {
            self.desired_state = Some(desired);
            return true;
        }
        if engine().plan(&self.observed_state, &desired).is_none() {
            return false;
        }
        self.desired_state = Some(desired);
        true
    }

    /// Refresh, then take one step toward `desired_state` if one is set and
    /// not yet reached, throttling repeated identical actions to at most
    /// once per 60 seconds.
    pub async fn poll(&mut self) {
        self.refresh().await;

        let Some(desired) = self.desired_state else {
            return;
        };
        if self.observed_state == desired {
            return;
        }

        let Some(action) = engine().plan(&self.observed_state, &desired) else {
            tracing::warn!(
                minion = %self.name,
                from = %self.observed_state,
                to = %desired,
                "no known path between states"
            );
            self.desired_state = None;
            return;
        };

        if self.last_action == Some(action) && self.last_action_state == Some(self.observed_state) {
            if let Some(last_time) = self.last_action_time {
                if last_time.elapsed() < RETRY_THROTTLE {
                    return;
                }
            }
        }

        let Some(id) = self.id.clone() else {
            return;
        };
        match action {
            Action::Start => {
                if let Err(err) = self.driver.start(&id) {
                    tracing::error!(minion = %self.name, %err, "start failed");
                }
            }
            Action::Stop => {
                if let Err(err) = self.driver.stop(&id) {
                    tracing::error!(minion = %self.name, %err, "stop failed");
                }
            }
            Action::Wait => {}
        }

        self.last_action = Some(action);
        self.last_action_state = Some(self.observed_state);
        self.last_action_time = Some(Instant::now());
    }
}

/// Find every instance matching `tags` and wrap each as a `Minion`, sorted
/// by name. An instance discovered without a `Name` tag is a hard error:
/// the provider-level `UnnamedInstance` propagates unchanged.
pub fn discover(driver: Arc<dyn InstanceDriver>, tags: &BTreeMap<String, String>) -> Result<Vec<Minion>, UnnamedInstance> {
    let mut instances = driver.list_by_tags(tags)?;
    instances.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(instances
        .into_iter()
        .map(|inst| Minion::new(inst.name, Some(inst.id), driver.clone()))
        .collect())
}
