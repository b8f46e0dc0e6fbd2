//! The per-proc supervision loop: launch, watch for 1-second survival,
//! restart with exponential backoff on any exit. There is no terminal
//! state; a proc is restarted forever until the whole supervisor process
//! is killed.
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use supervisor_config::Proc;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

const MIN_SLEEP: Duration = Duration::from_millis(100);
const MAX_SLEEP: Duration = Duration::from_secs(10);
const WARMUP: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct ProcState {
    pub healthy: AtomicBool,
    pub generation: AtomicU64,
}

impl ProcState {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Runs forever, restarting `proc` with exponential backoff. `cancel`
/// observes supervisor-wide shutdown; child processes are not explicitly
/// terminated on cancellation (see the design note in `main.rs`) and are
/// left to the container runtime's normal process-group teardown.
#[instrument(skip(proc, cancel, state), fields(proc_id = %proc.id, port))]
pub async fn run(proc: Proc, port: u16, state: Arc<ProcState>, mut cancel: tokio::sync::watch::Receiver<bool>) {
    let mut retry_sleep = MIN_SLEEP;

    loop {
        if *cancel.borrow() {
            return;
        }

        let snapshot = state.generation.load(Ordering::SeqCst);

        let mut command = build_command(&proc, port);
        let spawned = command.spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                warn!(error = %err, "failed to start proc");
                let this_sleep = back_off(&state, retry_sleep);
                tokio::select! {
                    _ = sleep(this_sleep) => {}
                    _ = cancel.changed() => return,
                }
                retry_sleep = next_retry_sleep(this_sleep);
                continue;
            }
        };

        let warmup_state = state.clone();
        tokio::spawn(async move {
            sleep(WARMUP).await;
            if warmup_state.generation.load(Ordering::SeqCst) == snapshot {
                warmup_state.healthy.store(true, Ordering::SeqCst);
            }
        });

        let wait_result = tokio::select! {
            result = child.wait() => result,
            _ = cancel.changed() => {
                return;
            }
        };

        match wait_result {
            Ok(status) => info!(status = %status, "proc exited"),
            Err(err) => warn!(error = %err, "error waiting for proc"),
        }

        let this_sleep = back_off(&state, retry_sleep);
        tokio::select! {
            _ = sleep(this_sleep) => {}
            _ = cancel.changed() => return,
        }
        retry_sleep = next_retry_sleep(this_sleep);
    }
}

fn build_command(proc: &Proc, port: u16) -> Command {
    let mut command = Command::new(&proc.command[0]);
    command.args(&proc.command[1..]);
    for entry in &proc.env {
        if let Some((key, value)) = entry.split_once('=') {
            command.env(key, value);
        }
    }
    command.env("PORT", port.to_string());
    command.stdout(Stdio::inherit());
    command.stderr(Stdio::inherit());
    command
}

/// Marks the proc unhealthy and bumps its generation, then returns the
/// sleep to use for *this* failure: `MIN_SLEEP` if the proc survived its
/// warmup window since its last start (the healthy-reset rule), otherwise
/// `retry_sleep` unchanged. The caller sleeps this value, then derives the
/// next round's `retry_sleep` via `next_retry_sleep`.
fn back_off(state: &ProcState, retry_sleep: Duration) -> Duration {
    let was_healthy = state.healthy.swap(false, Ordering::SeqCst);
    state.generation.fetch_add(1, Ordering::SeqCst);
    if was_healthy {
        MIN_SLEEP
    } else {
        retry_sleep
    }
}

/// Doubles a just-used backoff sleep for the next round, capped at `MAX_SLEEP`.
fn next_retry_sleep(sleep_used: Duration) -> Duration {
    std::cmp::min(sleep_used * 2, MAX_SLEEP)
}

#[cfg(test)]
mod test {
    use super::*;

    /// Three immediate consecutive failures observe sleeps of 100ms, 200ms,
    /// 400ms in that order: the proc sleeps at the *current* retry_sleep,
    /// then doubles it for next time.
    #[test]
    fn three_immediate_failures_sleep_100_200_400() {
        let state = ProcState::default();
        let mut retry_sleep = MIN_SLEEP;

        let first = back_off(&state, retry_sleep);
        assert_eq!(first, Duration::from_millis(100));
        retry_sleep = next_retry_sleep(first);

        let second = back_off(&state, retry_sleep);
        assert_eq!(second, Duration::from_millis(200));
        retry_sleep = next_retry_sleep(second);

        let third = back_off(&state, retry_sleep);
        assert_eq!(third, Duration::from_millis(400));
    }

    #[test]
    fn backoff_caps_at_max_sleep() {
        let state = ProcState::default();
        let mut retry_sleep = MIN_SLEEP;
        for _ in 0..20 {
            let this_sleep = back_off(&state, retry_sleep);
            retry_sleep = next_retry_sleep(this_sleep);
        }
        assert_eq!(retry_sleep, MAX_SLEEP);
    }

    #[test]
    fn healthy_reset_brings_sleep_back_to_minimum() {
        let state = ProcState::default();
        let first = back_off(&state, MIN_SLEEP);
        let mut retry_sleep = next_retry_sleep(first);
        let second = back_off(&state, retry_sleep);
        retry_sleep = next_retry_sleep(second);
        assert!(retry_sleep > MIN_SLEEP);

        state.healthy.store(true, Ordering::SeqCst);
        let after_recovery = back_off(&state, retry_sleep);
        assert_eq!(after_recovery, MIN_SLEEP);
    }

    /// A proc whose command always fails immediately spends most of its
    /// time asleep in the exponential backoff; cancellation must cut that
    /// sleep short rather than waiting it out.
    #[tokio::test]
    async fn cancellation_during_backoff_sleep_is_prompt() {
        let proc = Proc {
            id: "proc_always_fails".into(),
            command: vec!["/bin/false".into()],
            env: vec![],
            services: vec![],
            gateways: vec![],
        };
        let state = Arc::new(ProcState::default());
        let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(run(proc, 12000, state, cancel_rx));

        // Give the loop time to fail once and settle into its backoff sleep
        // (up to MAX_SLEEP, far longer than this test's own timeout).
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("run() should return promptly once cancelled, not after the full backoff sleep")
            .unwrap();
    }
}
