// src/core/tasks/mod.rs

//! Long-running background tasks that keep presence records fresh and reap
//! dead sessions and expired keys.

pub mod broker_refresher;
pub mod heartbeat_sweeper;
pub mod store_purger;
