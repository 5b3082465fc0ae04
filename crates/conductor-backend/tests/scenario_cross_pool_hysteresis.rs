//! A pool must not shrink its last members while a peer pool is still
//! below its own desired size, or the two would thrash: one pool drains to
//! free capacity for the other, only to start shrinking itself the moment
//! it notices nobody is claiming it either.
//!
//! Members here are exercised in the STARTING state rather than UP: reaching
//! UP and having it survive a `poll()` tick requires a live TCP probe
//! against the member's `private_ip:50000` (see `conductor-minion`), which
//! would collide with the fixed port other scenario tests bind. STARTING is
//! just as valid a target for the down-rule's shrink gate and needs no
//! probe.

use std::collections::BTreeMap;
use std::sync::Arc;

use conductor_backend::Backend;
use conductor_minion::Minion;
use conductor_pool::Pool;
use conductor_provider::{Instance, InstanceState};
use conductor_sql::{MapiUrl, SqlConnector};
use conductor_testkit::{FakeInstanceDriver, FakeSqlConnector};

async fn starting_pool(name: &str) -> Arc<Pool> {
    let driver = Arc::new(FakeInstanceDriver::new());
    driver.seed(Instance {
        id: format!("{name}-i-1"),
        name: "a".into(),
        state: InstanceState::Pending,
        private_ip: None,
    });
    let minion = Minion::new("a", Some(format!("{name}-i-1")), driver);
    Arc::new(Pool::new(name, vec![minion]).await)
}

async fn down_pool(name: &str) -> Arc<Pool> {
    let driver = Arc::new(FakeInstanceDriver::new());
    driver.seed(Instance {
        id: format!("{name}-i-1"),
        name: "a".into(),
        state: InstanceState::Stopped,
        private_ip: None,
    });
    let minion = Minion::new("a", Some(format!("{name}-i-1")), driver);
    Arc::new(Pool::new(name, vec![minion]).await)
}

fn backend(pools: BTreeMap<String, Arc<Pool>>) -> Arc<Backend> {
    let explainer = Arc::new(FakeSqlConnector::new(MapiUrl::parse("mapi:monetdb://explainer/demo").unwrap()));
    let template = MapiUrl::parse("mapi:monetdb://HOSTNAME/demo").unwrap();
    let mut specs = BTreeMap::new();
    for name in pools.keys() {
        specs.insert(name.clone(), 1u64 << 30);
    }
    Backend::new(
        pools,
        specs,
        explainer,
        template,
        Arc::new(|_url| Arc::new(FakeSqlConnector::new(MapiUrl::parse("mapi:monetdb://x/demo").unwrap())) as Arc<dyn SqlConnector>),
    )
    .unwrap()
}

#[tokio::test]
async fn large_pool_withholds_shrink_while_small_pool_is_below_desired() {
    let large = starting_pool("LARGE").await;
    assert_eq!(large.classify().starting.len(), 1, "LARGE should start with its one member starting");

    let small = down_pool("SMALL").await;
    small.set_desired(1); // SMALL wants a member up but never gets one here.
    assert_eq!(small.actual(), 0);

    let mut pools = BTreeMap::new();
    pools.insert("LARGE".to_string(), large.clone());
    pools.insert("SMALL".to_string(), small.clone());
    let backend = backend(pools);

    large.set_desired(0); // LARGE no longer needs its member.
    backend.update_shrink_hysteresis();
    assert!(!large.shrink_allowed(), "LARGE must not be allowed to shrink while SMALL is still below desired");

    large.poll().await;
    assert_eq!(large.classify().starting.len(), 1, "LARGE's last member must survive the tick while SMALL is starved");

    // SMALL catches up (stops asking for a member it'll never get).
    small.set_desired(0);
    backend.update_shrink_hysteresis();
    assert!(large.shrink_allowed(), "LARGE may shrink once every other pool is at or above its desired size");

    large.poll().await;
    assert_eq!(large.classify().starting.len(), 0, "LARGE should now shrink its idle member");
}

#[tokio::test]
async fn single_pool_backend_always_allows_its_own_shrink() {
    let only = starting_pool("SOLO").await;
    let mut pools = BTreeMap::new();
    pools.insert("SOLO".to_string(), only.clone());
    let backend = backend(pools);

    only.set_desired(0);
    backend.update_shrink_hysteresis();
    assert!(only.shrink_allowed(), "a pool with no peers is vacuously caught up and may always shrink");

    only.poll().await;
    assert_eq!(only.classify().starting.len(), 0);
}
