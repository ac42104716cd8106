use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{CorrectionOracle, OracleRequest, OracleVerdict};

/// Replays a fixed queue of verdicts. Used for dry runs and tests.
#[derive(Clone, Default)]
pub struct ScriptedOracle {
    script: Arc<Mutex<VecDeque<OracleVerdict>>>,
    calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl ScriptedOracle {
    pub fn new(verdicts: impl IntoIterator<Item = OracleVerdict>) -> Self {
        Self {
            script: Arc::new(Mutex::new(verdicts.into_iter().collect())),
            ..Default::default()
        }
    }

    /// Sleeps before answering, to exercise caller timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CorrectionOracle for ScriptedOracle {
    async fn propose(&self, _request: OracleRequest<'_>) -> OracleVerdict {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| OracleVerdict::unavailable("script exhausted"))
    }
}
