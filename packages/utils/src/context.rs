use std::sync::{atomic::AtomicBool, Arc};

use tokio::runtime::Runtime;

/// Process-wide context: the tokio runtime plus a broadcast kill switch.
///
/// Every autonomous loop holds a kill receiver and exits at its next await
/// point once `kill()` fires; the HTTP server wires it into graceful
/// shutdown.
#[derive(Clone)]
pub struct AppContext {
    pub rt: Arc<Runtime>,
    killed: Arc<AtomicBool>,
    kill_sender: tokio::sync::broadcast::Sender<()>,
    // held so a kill() with no live subscribers doesn't error
    _kill_receiver: Arc<tokio::sync::broadcast::Receiver<()>>,
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AppContext {
    pub fn new() -> Self {
        Self::with_worker_threads(4)
    }

    pub fn with_worker_threads(worker_threads: usize) -> Self {
        let rt = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(worker_threads)
                .enable_all()
                .build()
                .unwrap(),
        );

        let (kill_sender, kill_receiver) = tokio::sync::broadcast::channel(1);

        Self {
            rt,
            kill_sender,
            _kill_receiver: Arc::new(kill_receiver),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn get_kill_receiver(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.kill_sender.subscribe()
    }

    /// Typically only called from main (ctrl-c handler) or tests.
    pub fn kill(&self) {
        self.killed.store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = self.kill_sender.send(());
    }

    pub fn killed(&self) -> bool {
        self.killed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kill_flag_flips_once() {
        let ctx = AppContext::new();
        assert!(!ctx.killed());
        ctx.kill();
        assert!(ctx.killed());
        // second kill with the receiver possibly drained must not panic
        ctx.kill();
    }

    #[test]
    fn kill_wakes_subscribers() {
        let ctx = AppContext::new();
        let mut rx = ctx.get_kill_receiver();
        ctx.kill();
        ctx.rt.block_on(async move {
            rx.recv().await.unwrap();
        });
    }
}
