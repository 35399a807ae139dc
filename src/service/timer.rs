use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::server::TransportEvent;

/// Handle to a one-shot timer created with `set_timer`.
///
/// Cancellation is best-effort: if the timer already fired, or is firing
/// concurrently, the tick may still be observed by the listener.
#[derive(Debug)]
pub struct TimerHandle {
    cancel: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub(crate) fn spawn_timer(
    duration: Duration,
    event_tx: mpsc::Sender<TransportEvent>,
) -> TimerHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = time::sleep(duration) => {
                let _ = event_tx.send(TransportEvent::Timer).await;
            }
            _ = token.cancelled() => {}
        }
    });
    TimerHandle { cancel }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_duration() {
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let started = Instant::now();

        let _handle = spawn_timer(Duration::from_millis(500), event_tx);

        let event = event_rx.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Timer));
        assert!(started.elapsed() >= Duration::from_millis(500));

        // the timer task is done and its sender dropped, so a second tick
        // can never arrive
        assert!(event_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_firing_suppresses_the_tick() {
        let (event_tx, mut event_rx) = mpsc::channel(4);

        let handle = spawn_timer(Duration::from_secs(5), event_tx);
        handle.cancel();
        assert!(handle.is_cancelled());

        assert!(event_rx.recv().await.is_none());
    }
}
