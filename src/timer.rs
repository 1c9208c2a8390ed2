use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const PLACEHOLDER_PREFIX: &str = "WAITING_FOR_BRIDGE-";

#[derive(Debug, Clone)]
struct Placeholder {
    payload: String,
    generation: u64,
    generated_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrSnapshot {
    pub payload: String,
    pub generation: u64,
    pub seconds_remaining: u64,
}

pub struct QrRefreshTimer {
    period: Duration,
    current: Arc<Mutex<Placeholder>>,
    notify: watch::Sender<u64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QrRefreshTimer {
    pub fn new(period: Duration) -> Self {
        let (notify, _) = watch::channel(0);
        let current = Placeholder { payload: placeholder_payload(), generation: 0, generated_at: Instant::now() };
        Self { period, current: Arc::new(Mutex::new(current)), notify, task: Mutex::new(None) }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let current = self.current.clone();
        let notify = self.notify.clone();
        let period = self.period;
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let generation = rotate(&current);
                notify.send_replace(generation);
                tracing::trace!(generation, "qr placeholder rotated");
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    // rotates now; restarts the countdown only if the timer was running
    pub fn reset(&self) {
        let was_running = self.is_running();
        self.stop();
        let generation = rotate(&self.current);
        self.notify.send_replace(generation);
        if was_running {
            self.start();
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    pub fn current(&self) -> QrSnapshot {
        let p = self.current.lock().clone();
        let elapsed = p.generated_at.elapsed();
        let remaining = self.period.saturating_sub(elapsed);
        QrSnapshot { payload: p.payload, generation: p.generation, seconds_remaining: remaining.as_secs() }
    }
}

impl Drop for QrRefreshTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn rotate(current: &Mutex<Placeholder>) -> u64 {
    let mut p = current.lock();
    p.payload = placeholder_payload();
    p.generation += 1;
    p.generated_at = Instant::now();
    p.generation
}

pub fn placeholder_payload() -> String {
    let token: String = rand::thread_rng().sample_iter(&Alphanumeric).take(8).map(char::from).collect();
    format!("{}{}", PLACEHOLDER_PREFIX, token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rotates_once_per_period() {
        let timer = QrRefreshTimer::new(Duration::from_secs(20));
        let first = timer.current();
        assert_eq!(first.generation, 0);
        assert_eq!(first.seconds_remaining, 20);
        assert!(first.payload.starts_with(PLACEHOLDER_PREFIX));

        let mut rx = timer.subscribe();
        let started = Instant::now();
        timer.start();
        assert!(timer.is_running());
        rx.changed().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(20));
        assert_eq!(*rx.borrow_and_update(), 1);
        assert_ne!(timer.current().payload, first.payload);

        rx.changed().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(40));
        assert_eq!(timer.current().generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_rotation() {
        let timer = QrRefreshTimer::new(Duration::from_secs(15));
        timer.start();
        timer.stop();
        assert!(!timer.is_running());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(timer.current().generation, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_rotates_now_and_restarts_countdown() {
        let timer = QrRefreshTimer::new(Duration::from_secs(20));
        timer.start();
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(timer.current().seconds_remaining, 8);

        timer.reset();
        let snap = timer.current();
        assert_eq!(snap.generation, 1);
        assert_eq!(snap.seconds_remaining, 20);
        assert!(timer.is_running());

        let mut rx = timer.subscribe();
        let t = Instant::now();
        rx.changed().await.unwrap();
        assert_eq!(t.elapsed(), Duration::from_secs(20));
        assert_eq!(timer.current().generation, 2);
    }

    #[tokio::test]
    async fn start_twice_keeps_one_task() {
        let timer = QrRefreshTimer::new(Duration::from_secs(3600));
        timer.start();
        timer.start();
        assert!(timer.is_running());
        timer.stop();
        assert!(!timer.is_running());
    }
}
