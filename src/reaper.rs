use std::sync::Arc;
use tokio::time::interval;
use tracing::info;

use crate::session::SessionManager;

/// Background sweep that closes sessions idle past their timeout and retries
/// parked container removals. The first tick fires immediately, which doubles
/// as the opportunistic startup sweep.
pub fn spawn(manager: Arc<SessionManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(manager.config().reaper_interval);
        loop {
            ticker.tick().await;
            let closed = manager.sweep_idle().await;
            if closed > 0 {
                info!(closed, "reaper pass finished");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionManager;
    use crate::testutil::{test_config, FakeRuntime};
    use std::time::Duration;

    #[tokio::test]
    async fn loop_reaps_idle_sessions() {
        let mut config = test_config();
        config.idle_timeout = Duration::from_millis(20);
        config.reaper_interval = Duration::from_millis(10);
        let runtime = Arc::new(FakeRuntime::new());
        let manager = Arc::new(SessionManager::new(config, runtime.clone()));

        let session = manager.create_session(None).await.unwrap();
        let handle = spawn(Arc::clone(&manager));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(manager.lookup(&session.id).is_err());
        assert_eq!(runtime.live_containers(), 0);

        handle.abort();
    }
}
