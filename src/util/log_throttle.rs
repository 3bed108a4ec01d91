use ahash::AHashMap as HashMap;
use log::{error, warn};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Suppresses repeated identical warnings and errors.
///
/// A message is logged the first time it is seen and then at most once per
/// `timeout`. Used for secondary failures that can repeat for every
/// transaction, such as lost backup acknowledgments.
pub struct LogThrottle {
    timeout: Duration,
    last_logged: Mutex<HashMap<String, Instant>>,
}

impl LogThrottle {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_logged: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `msg` should be logged now, recording the attempt.
    fn admit(&self, msg: &str) -> bool {
        let now = Instant::now();
        let mut last = self.last_logged.lock();
        match last.get(msg) {
            Some(at) if now.duration_since(*at) < self.timeout => false,
            _ => {
                last.insert(msg.to_string(), now);
                true
            }
        }
    }

    pub fn warn(&self, msg: &str) -> bool {
        let admitted = self.admit(msg);
        if admitted {
            warn!("{}", msg);
        }
        admitted
    }

    pub fn error(&self, msg: &str) -> bool {
        let admitted = self.admit(msg);
        if admitted {
            error!("{}", msg);
        }
        admitted
    }

    /// Forgets every recorded message.
    pub fn clear(&self) {
        self.last_logged.lock().clear();
    }
}
