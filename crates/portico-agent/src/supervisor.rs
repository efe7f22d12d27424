//! Idle-shutdown supervisor.
//!
//! Watches registry events: when the last extension host closes, a
//! cancellable shutdown timer starts. Firing with zero extension hosts
//! left delivers the exit code to the main loop; a connection racing in
//! cancels the attempt. `/delay-shutdown` restarts a pending timer and
//! is otherwise a no-op. Management connections never count.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::registry::RegistryEvent;

/// Handle for poking the supervisor from the HTTP surface.
#[derive(Clone)]
pub struct SupervisorHandle {
    poke_tx: Option<mpsc::UnboundedSender<()>>,
}

impl SupervisorHandle {
    /// Handle for an agent running without auto-shutdown.
    pub fn disabled() -> Self {
        Self { poke_tx: None }
    }

    /// Restart a pending shutdown timer (`GET /delay-shutdown`).
    pub fn delay_shutdown(&self) {
        if let Some(tx) = &self.poke_tx {
            let _ = tx.send(());
        }
    }
}

/// Spawn the supervisor task.
///
/// `count` reports the current number of live extension hosts; it backs
/// the recheck that makes a late timer fire harmless.
pub fn spawn(
    timeout: Duration,
    events: broadcast::Receiver<RegistryEvent>,
    count: impl Fn() -> usize + Send + 'static,
    shutdown_tx: mpsc::Sender<i32>,
) -> SupervisorHandle {
    let (poke_tx, poke_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(timeout, events, count, poke_rx, shutdown_tx));
    SupervisorHandle {
        poke_tx: Some(poke_tx),
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run(
    timeout: Duration,
    mut events: broadcast::Receiver<RegistryEvent>,
    count: impl Fn() -> usize,
    mut poke_rx: mpsc::UnboundedReceiver<()>,
    shutdown_tx: mpsc::Sender<i32>,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(RegistryEvent::ExtensionHostClosed { remaining: 0, .. }) => {
                    info!(
                        timeout_secs = timeout.as_secs(),
                        "last extension host closed, scheduling shutdown"
                    );
                    deadline = Some(Instant::now() + timeout);
                }
                Ok(RegistryEvent::ExtensionHostClosed { .. }) => {}
                Ok(RegistryEvent::ExtensionHostOpened { .. }) => {
                    if deadline.take().is_some() {
                        info!("extension host opened, shutdown cancelled");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "supervisor lagged behind registry events");
                    if count() == 0 && deadline.is_none() {
                        deadline = Some(Instant::now() + timeout);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            poke = poke_rx.recv() => match poke {
                Some(()) => {
                    if deadline.is_some() {
                        debug!("shutdown delayed by client request");
                        deadline = Some(Instant::now() + timeout);
                    }
                }
                None => break,
            },
            _ = wait_deadline(deadline) => {
                deadline = None;
                if count() == 0 {
                    info!("no extension hosts for the full grace period, shutting down");
                    let _ = shutdown_tx.send(0).await;
                    break;
                }
                info!("shutdown timer fired but an extension host raced in");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Harness {
        events_tx: broadcast::Sender<RegistryEvent>,
        count: Arc<AtomicUsize>,
        handle: SupervisorHandle,
        shutdown_rx: mpsc::Receiver<i32>,
    }

    fn harness(timeout: Duration) -> Harness {
        let (events_tx, events_rx) = broadcast::channel(64);
        let count = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let count_clone = Arc::clone(&count);
        let handle = spawn(
            timeout,
            events_rx,
            move || count_clone.load(Ordering::SeqCst),
            shutdown_tx,
        );
        Harness {
            events_tx,
            count,
            handle,
            shutdown_rx,
        }
    }

    fn closed(h: &Harness, remaining: usize) {
        h.count.store(remaining, Ordering::SeqCst);
        h.events_tx
            .send(RegistryEvent::ExtensionHostClosed {
                token: "t".into(),
                remaining,
            })
            .unwrap();
    }

    fn opened(h: &Harness) {
        h.count.fetch_add(1, Ordering::SeqCst);
        h.events_tx
            .send(RegistryEvent::ExtensionHostOpened { token: "t".into() })
            .unwrap();
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    const FIVE_MIN: Duration = Duration::from_secs(300);

    #[tokio::test(start_paused = true)]
    async fn fires_after_grace_period_with_zero_hosts() {
        let mut h = harness(FIVE_MIN);
        closed(&h, 0);
        settle().await;

        tokio::time::advance(FIVE_MIN).await;
        settle().await;
        assert_eq!(h.shutdown_rx.try_recv().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn new_host_before_fire_cancels_timer() {
        let mut h = harness(FIVE_MIN);
        closed(&h, 0);
        settle().await;

        tokio::time::advance(FIVE_MIN - Duration::from_secs(1)).await;
        settle().await;
        opened(&h);
        settle().await;

        tokio::time::advance(FIVE_MIN * 2).await;
        settle().await;
        assert!(h.shutdown_rx.try_recv().is_err());

        // Scenario continues: the second close restarts the clock.
        closed(&h, 0);
        settle().await;
        tokio::time::advance(FIVE_MIN).await;
        settle().await;
        assert_eq!(h.shutdown_rx.try_recv().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_shutdown_restarts_pending_timer() {
        let mut h = harness(FIVE_MIN);
        closed(&h, 0);
        settle().await;

        tokio::time::advance(Duration::from_secs(240)).await;
        settle().await;
        h.handle.delay_shutdown();
        settle().await;

        // 4 minutes after the poke, the original deadline has long
        // passed, but the restarted one has not.
        tokio::time::advance(Duration::from_secs(240)).await;
        settle().await;
        assert!(h.shutdown_rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(h.shutdown_rx.try_recv().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_shutdown_without_pending_timer_is_noop() {
        let mut h = harness(FIVE_MIN);
        h.handle.delay_shutdown();
        settle().await;

        tokio::time::advance(FIVE_MIN * 3).await;
        settle().await;
        assert!(h.shutdown_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fire_with_live_host_does_not_exit() {
        let mut h = harness(FIVE_MIN);
        closed(&h, 0);
        settle().await;

        // A host appears without the supervisor seeing an Opened event
        // (it only shows up in the recheck).
        h.count.store(1, Ordering::SeqCst);
        tokio::time::advance(FIVE_MIN).await;
        settle().await;
        assert!(h.shutdown_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn nonzero_remaining_does_not_schedule() {
        let mut h = harness(FIVE_MIN);
        closed(&h, 2);
        settle().await;

        tokio::time::advance(FIVE_MIN * 2).await;
        settle().await;
        assert!(h.shutdown_rx.try_recv().is_err());
    }

    #[test]
    fn disabled_handle_is_inert() {
        SupervisorHandle::disabled().delay_shutdown();
    }
}
