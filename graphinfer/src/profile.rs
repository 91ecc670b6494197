//! JSON profiling sink for session and node events.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
struct ProfileEvent {
    cat: &'static str,
    name: String,
    ts_us: u128,
    dur_us: u128,
}

#[derive(Debug)]
pub struct Profiler {
    enabled: AtomicBool,
    origin: Instant,
    file_prefix: Mutex<String>,
    events: Mutex<Vec<ProfileEvent>>,
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Profiler {
    pub fn new() -> Self {
        Profiler {
            enabled: AtomicBool::new(false),
            origin: Instant::now(),
            file_prefix: Mutex::new(String::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn start_profiling(&self, file_prefix: &str) {
        *self.file_prefix.lock().expect("profiler prefix poisoned") = file_prefix.to_string();
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn start_time(&self) -> Instant {
        Instant::now()
    }

    pub fn record(&self, cat: &'static str, name: &str, begin: Instant) {
        if !self.is_enabled() {
            return;
        }
        let event = ProfileEvent {
            cat,
            name: name.to_string(),
            ts_us: begin.duration_since(self.origin).as_micros(),
            dur_us: begin.elapsed().as_micros(),
        };
        self.events.lock().expect("profiler events poisoned").push(event);
    }

    /// Stop profiling and write the captured events; returns the file path,
    /// or None when profiling was never started.
    pub fn end_profiling(&self) -> Option<String> {
        if !self.enabled.swap(false, Ordering::Relaxed) {
            return None;
        }
        let prefix = self.file_prefix.lock().expect("profiler prefix poisoned").clone();
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let path = format!("{}_{}.json", prefix, stamp);
        let events = self.events.lock().expect("profiler events poisoned");
        match serde_json::to_string_pretty(&*events) {
            Ok(body) => {
                if let Err(err) = fs::write(&path, body) {
                    crate::error!("could not write profile {}: {}", path, err);
                    return None;
                }
                Some(path)
            }
            Err(err) => {
                crate::error!("could not serialize profile: {}", err);
                None
            }
        }
    }
}
