use super::*;
use futures::future::join_all;
use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A repeating background task that can be stopped between ticks.
pub(super) struct BackgroundJob {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundJob {
    fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => tick().await,
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("{} job stopped", name);
        });
        Self {
            name,
            stop_tx,
            handle,
        }
    }

    /// Signals the job and waits until a tick in progress has finished.
    pub(super) async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(err) = self.handle.await {
            error!("{} job ended abnormally: {}", self.name, err);
        }
    }
}

pub(super) fn start_progress_loop(engine: Arc<ProgressEngine>, period: Duration) -> BackgroundJob {
    info!("progress updates every {:?}", period);
    BackgroundJob::spawn("progress", period, move || run_progress_tick(engine.clone()))
}

/// Reconciles every active chat concurrently and waits for all of them.
pub(super) async fn run_progress_tick(engine: Arc<ProgressEngine>) {
    let chats = engine.active_chats().await;
    join_all(chats.into_iter().map(|chat_id| {
        let engine = engine.clone();
        async move { engine.reconcile(chat_id, false).await }
    }))
    .await;
}

pub(super) fn start_cleanup_loop(states: Arc<MessageStateStore>, period: Duration) -> BackgroundJob {
    BackgroundJob::spawn("cleanup", period, move || {
        let states = states.clone();
        async move {
            match states.delete_expired_before(now_ts()).await {
                Ok(0) => {}
                Ok(purged) => info!("purged {} expired message states", purged),
                Err(err) => error!("message state cleanup failed: {:#}", err),
            }
        }
    })
}
