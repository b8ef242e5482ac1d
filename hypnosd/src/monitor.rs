//! Waker-side timeout checker loop.
//!
//! WAKING -> FAILED and ON -> OFF are time-driven and must fire even when
//! no request comes in, so a background task polls the state machine. The
//! 10s cadence bounds how late a timeout can be noticed; it is deliberately
//! independent of the configured heartbeat and wake windows.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::state_machine::SleeperStateMachine;

pub const CHECK_PERIOD: Duration = Duration::from_secs(10);

pub fn spawn_timeout_checker(machine: Arc<SleeperStateMachine>) {
    tokio::spawn(async move {
        info!(
            "timeout checker started, {}s period",
            CHECK_PERIOD.as_secs()
        );
        let mut ticker = tokio::time::interval(CHECK_PERIOD);
        loop {
            ticker.tick().await;
            // A panic out of the check must not kill the loop.
            match std::panic::catch_unwind(AssertUnwindSafe(|| machine.check_timeouts())) {
                Ok(state) => debug!("timeout check complete, state {state}"),
                Err(_) => error!("timeout check panicked, continuing"),
            }
        }
    });
}
