//! Bridge blocking operations and kernel readiness notifications to
//! cooperative async callers.
//!
//! Two independently usable cores share one concurrency discipline:
//!
//! * The **blocking lane** ([`Pool`]) runs opaque blocking operations on
//!   dedicated worker threads, with bounded queueing, backpressure,
//!   acceptance deadlines and exactly-once resumption of the caller.
//! * The **readiness selector** ([`Selector`]) multiplexes descriptor
//!   registrations over a dedicated poll thread (epoll or kqueue) and
//!   exposes a typestated register/arm/await lifecycle. [`Channel`] builds
//!   EAGAIN-retry socket I/O on top of it.
//!
//! In both cores, continuations are resumed from exactly one place, kernel
//! filters are armed one-shot edge-triggered, and no caller-facing call
//! blocks the async scheduler.
//!
//! # Example
//!
//! ```no_run
//! use relay_io::{Pool, PoolConfig};
//!
//! let pool = Pool::new(PoolConfig::default());
//! let sum = futures::executor::block_on(pool.run(None, || (1..=10).sum::<i32>()));
//! assert_eq!(sum.unwrap(), 55);
//! pool.shutdown();
//! ```

mod channel;
mod error;
mod event;
mod global;
mod interest;
mod lane;
mod selector;
mod sys;

pub mod driver;

pub use channel::Channel;

pub use error::{ChannelError, LaneError, LeafError, MakeError, SelectorError};

pub use event::{Event, EventFlags};

pub use interest::Interest;

pub use lane::{
    Backpressure, JobCanceller, JobHandle, LatencyStat, MetricsSnapshot, PayloadBox, Pool,
    PoolConfig, QueueTransition, Scheduling,
};

pub use selector::{
    ArmHandle, ArmOutcome, Armed, BeginOutcome, Phase, Registering, Selector, SelectorDepths,
    Token,
};

pub use driver::{Capabilities, Driver, DriverKind, FakeDriver, FakeHandle, WakeHandle};

pub use global::{shared_pool, shared_selector};
