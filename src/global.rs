//! Process-wide shared instances, built on first use.
//!
//! Neither instance is ever shut down in normal operation; they rely on
//! process teardown. Tests that assert on shutdown behavior or metrics
//! should construct their own instances instead.

use once_cell::sync::Lazy;

use crate::lane::{Pool, PoolConfig};
use crate::selector::Selector;

static POOL: Lazy<Pool> = Lazy::new(|| Pool::new(PoolConfig::default()));

static SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::new().expect("failed to create the shared selector"));

/// The process-wide blocking lane.
pub fn shared_pool() -> &'static Pool {
    &POOL
}

/// The process-wide readiness selector over the platform default driver.
pub fn shared_selector() -> &'static Selector {
    &SELECTOR
}
