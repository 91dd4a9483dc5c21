use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    pub phase: String,
    pub files_total: Option<u64>,
    pub files_done: Option<u64>,
    pub bytes_done: Option<u64>,
    pub groups_found: Option<u64>,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: TaskProgress);
}

/// Forwards at most one update per `min_interval`, except forced ones.
pub struct ThrottledProgress<'a> {
    sink: Option<&'a dyn ProgressSink>,
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(sink: Option<&'a dyn ProgressSink>, min_interval: Duration) -> Self {
        Self {
            sink,
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub fn update(&self, progress: TaskProgress) {
        self.emit(progress, false);
    }

    pub fn force(&self, progress: TaskProgress) {
        self.emit(progress, true);
    }

    fn emit(&self, progress: TaskProgress, force: bool) {
        let Some(sink) = self.sink else {
            return;
        };
        let now = Instant::now();
        {
            let Ok(mut last) = self.last.lock() else {
                return;
            };
            if !force
                && let Some(prev) = *last
                && now.duration_since(prev) < self.min_interval
            {
                return;
            }
            *last = Some(now);
        }
        sink.on_progress(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl ProgressSink for Collect {
        fn on_progress(&self, progress: TaskProgress) {
            self.0.lock().unwrap().push(progress.phase);
        }
    }

    #[test]
    fn throttles_unforced_updates() {
        let sink = Collect::default();
        let throttled = ThrottledProgress::new(Some(&sink), Duration::from_secs(3600));
        throttled.update(TaskProgress {
            phase: "size".to_string(),
            ..TaskProgress::default()
        });
        throttled.update(TaskProgress {
            phase: "dropped".to_string(),
            ..TaskProgress::default()
        });
        throttled.force(TaskProgress {
            phase: "done".to_string(),
            ..TaskProgress::default()
        });
        assert_eq!(*sink.0.lock().unwrap(), vec!["size", "done"]);
    }
}
