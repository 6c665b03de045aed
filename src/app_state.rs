use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::orchestrator::DetectionPipeline;
use crate::render::PageSource;
use crate::store::EnvelopeStore;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn EnvelopeStore>,
    pub pages: Arc<dyn PageSource>,
    pub pipeline: DetectionPipeline,
    pub rate_limiter: Arc<RateLimiter>,
}

/// Limitador en memoria de peticiones de IA por usuario: ventana fija.
pub struct RateLimiter {
    /// Peticiones por usuario: (contador, inicio de la ventana).
    tracker: Mutex<HashMap<i64, (u64, Instant)>>,
    max_requests: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            tracker: Mutex::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    pub fn per_minute(max_requests: u64) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    /// `Ok(())` si se permite la petición, `Err(retry_after_secs)` si no.
    /// Un máximo de 0 desactiva el límite.
    pub async fn check(&self, user_id: i64) -> Result<(), u64> {
        if self.max_requests == 0 {
            return Ok(());
        }
        let mut tracker = self.tracker.lock().await;
        let now = Instant::now();
        // Descarta las ventanas vencidas.
        tracker.retain(|_, (_, start)| now.duration_since(*start) < self.window);
        let entry = tracker.entry(user_id).or_insert((0, now));

        entry.0 += 1;
        if entry.0 > self.max_requests {
            let remaining = self.window.saturating_sub(now.duration_since(entry.1));
            Err(remaining.as_secs().max(1))
        } else {
            Ok(())
        }
    }
}
