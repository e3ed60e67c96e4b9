//! File-system monitor for a unit's watch set.
//!
//! The notify callback runs on notify's own thread and forwards raw events
//! into a tokio channel. The monitor task filters them against the
//! [`WatchSet`], collapses bursts into one [`WatchSignal::Changed`] per quiet
//! period, and reports readiness once the watcher is attached.

mod set;

pub use set::WatchSet;

use std::time::Duration;

use notify::Watcher;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Notifications from a monitor to its unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchSignal {
    Ready,
    Changed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    Starting,
    Ready,
    Stopping,
    Stopped,
}

pub struct WatchMonitor {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    signals: mpsc::UnboundedSender<WatchSignal>,
    phase: watch::Sender<WatchPhase>,
}

impl WatchMonitor {
    /// Attach a watcher for `set` and start reporting on `signals`.
    pub fn start(
        set: WatchSet,
        debounce: Duration,
        signals: mpsc::UnboundedSender<WatchSignal>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (phase, _) = watch::channel(WatchPhase::Starting);
        let task = tokio::spawn(run(
            set,
            debounce,
            signals.clone(),
            phase.clone(),
            cancel.clone(),
        ));
        Self {
            cancel,
            task: Some(task),
            signals,
            phase,
        }
    }

    /// A monitor that reports ready and never sees a change.
    pub fn inert(signals: mpsc::UnboundedSender<WatchSignal>) -> Self {
        let _ = signals.send(WatchSignal::Ready);
        let (phase, _) = watch::channel(WatchPhase::Ready);
        Self {
            cancel: CancellationToken::new(),
            task: None,
            signals,
            phase,
        }
    }

    pub fn phase(&self) -> WatchPhase {
        *self.phase.borrow()
    }

    /// Detach the watcher, then report [`WatchSignal::Stopped`].
    pub async fn close(mut self) {
        self.phase.send_replace(WatchPhase::Stopping);
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Watch task ended abnormally: {}", e);
            }
        }
        self.phase.send_replace(WatchPhase::Stopped);
        let _ = self.signals.send(WatchSignal::Stopped);
    }
}

impl Drop for WatchMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    set: WatchSet,
    debounce: Duration,
    signals: mpsc::UnboundedSender<WatchSignal>,
    phase: watch::Sender<WatchPhase>,
    cancel: CancellationToken,
) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    // Keep the watcher alive for the lifetime of the loop.
    let _watcher = match attach(&set, event_tx) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::error!("Failed to start file watcher: {}", e);
            None
        }
    };

    phase.send_if_modified(|current| {
        if *current == WatchPhase::Starting {
            *current = WatchPhase::Ready;
            true
        } else {
            false
        }
    });
    if signals.send(WatchSignal::Ready).is_err() {
        return;
    }

    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            Some(event) = event_rx.recv() => {
                if set.is_change(&event) {
                    tracing::trace!("Watched change: {:?} {:?}", event.kind, event.paths);
                    deadline = Some(Instant::now() + debounce);
                }
            }

            _ = sleep_until(deadline), if deadline.is_some() => {
                deadline = None;
                if signals.send(WatchSignal::Changed).is_err() {
                    break;
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn attach(
    set: &WatchSet,
    events: mpsc::UnboundedSender<notify::Event>,
) -> notify::Result<notify::RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                let _ = events.send(event);
            }
            Err(e) => tracing::warn!("Watch error: {}", e),
        }
    })?;

    for (root, mode) in set.roots() {
        if !root.exists() {
            tracing::warn!("Watch root does not exist, skipping: {}", root.display());
            continue;
        }
        watcher.watch(root, *mode)?;
        tracing::debug!("Watching {} ({:?})", root.display(), mode);
    }

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn next(rx: &mut mpsc::UnboundedReceiver<WatchSignal>) -> Option<WatchSignal> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_inert_monitor_is_ready_and_stops() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = WatchMonitor::inert(tx);
        assert_eq!(next(&mut rx).await, Some(WatchSignal::Ready));
        assert_eq!(monitor.phase(), WatchPhase::Ready);
        monitor.close().await;
        assert_eq!(next(&mut rx).await, Some(WatchSignal::Stopped));
    }

    #[tokio::test]
    async fn test_burst_of_writes_is_one_change() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("module.sh");
        std::fs::write(&file, "a").unwrap();

        let set = WatchSet::parse(&[file.to_string_lossy().into_owned()]).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = WatchMonitor::start(set, Duration::from_millis(200), tx);
        assert_eq!(next(&mut rx).await, Some(WatchSignal::Ready));
        assert_eq!(monitor.phase(), WatchPhase::Ready);

        for i in 0..5 {
            std::fs::write(&file, format!("edit {}", i)).unwrap();
        }
        assert_eq!(next(&mut rx).await, Some(WatchSignal::Changed));

        // nothing else queued after the quiet period
        let extra = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(extra.is_err());

        monitor.close().await;
        assert_eq!(next(&mut rx).await, Some(WatchSignal::Stopped));
    }

    #[tokio::test]
    async fn test_unrelated_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("module.sh");
        std::fs::write(&file, "a").unwrap();

        let set = WatchSet::parse(&[file.to_string_lossy().into_owned()]).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = WatchMonitor::start(set, Duration::from_millis(20), tx);
        assert_eq!(next(&mut rx).await, Some(WatchSignal::Ready));

        std::fs::write(dir.path().join("other.txt"), "x").unwrap();
        let got = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(got.is_err());

        monitor.close().await;
    }

    #[tokio::test]
    async fn test_missing_root_still_reports_ready() {
        let set = WatchSet::parse(&["/nonexistent/hotmod/dir/module.sh".to_string()]).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = WatchMonitor::start(set, Duration::from_millis(20), tx);
        assert_eq!(next(&mut rx).await, Some(WatchSignal::Ready));
        monitor.close().await;
        assert_eq!(next(&mut rx).await, Some(WatchSignal::Stopped));
    }
}
