//! Shared test fixtures: an in-memory store, a settable RTC pinned to a
//! known Monday, and a settable environmental sensor.

use std::sync::Arc;

use crate::auto::ReferenceModel;
use crate::clock::ManualRtc;
use crate::config::SystemSettings;
use crate::core::{Core, CoreOptions};
use crate::store::Store;
use crate::weather::ManualEnv;

/// 2024-03-04 00:00:00 UTC, a Monday in a leap year.
pub(crate) const MONDAY_MIDNIGHT: i64 = 1_709_510_400;

pub(crate) struct TestRig {
    pub core: Arc<Core>,
    pub rtc: Arc<ManualRtc>,
    pub env: Arc<ManualEnv>,
}

impl TestRig {
    pub fn rtc_unix(&self) -> i64 {
        use crate::clock::Rtc;
        self.rtc.read().expect("manual rtc readable").to_unix().unwrap()
    }
}

async fn build(store: Store) -> TestRig {
    let rtc = Arc::new(ManualRtc::new(MONDAY_MIDNIGHT));
    let env = ManualEnv::new(20.0);
    let core = Core::new(CoreOptions {
        store,
        rtc: Box::new(Arc::clone(&rtc)),
        env_sensor: Box::new(Arc::clone(&env)),
        model: Box::new(ReferenceModel),
        channel_pins: [17, 18, 22, 23, 24, 25, 26, 27],
        master_pin: None,
        relay_active_low: true,
        settings: SystemSettings::default(),
        rain_mm_per_tip: 0.2,
    })
    .expect("core builds");
    TestRig {
        core: Arc::new(core),
        rtc,
        env,
    }
}

async fn mem_store() -> Store {
    let store = Store::open("sqlite::memory:").await.unwrap();
    store.migrate().await.unwrap();
    store
}

/// A core that has NOT booted yet.
pub(crate) async fn unbooted_core() -> Arc<Core> {
    build(mem_store().await).await.core
}

/// A booted core over a fresh in-memory store.
pub(crate) async fn test_core() -> Arc<Core> {
    let rig = build(mem_store().await).await;
    rig.core.boot().await.unwrap();
    rig.core
}

/// A booted core plus handles to its RTC and environmental sensor.
pub(crate) async fn test_core_with() -> TestRig {
    let rig = build(mem_store().await).await;
    rig.core.boot().await.unwrap();
    rig
}

/// A booted core plus a second handle to its store (for reboot tests).
pub(crate) async fn test_core_on_store() -> (Arc<Core>, Store) {
    let store = mem_store().await;
    let rig = build(store.clone()).await;
    rig.core.boot().await.unwrap();
    (rig.core, store)
}

/// An unbooted core over an existing store ("the next boot").
pub(crate) async fn core_on_store(store: Store) -> Arc<Core> {
    build(store).await.core
}
