//! Failure/warning flags shared between an endpoint's tick and its worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct MomentaryError {
    name: &'static str,
    until: Instant,
}

/// Health of one component.
///
/// * `failed` is permanent: once set the component does nothing.
/// * `warning` is a transient condition. [`Status::set_warning`] reports
///   whether it was newly raised so repeated faults log only once.
/// * A momentary error is an error that expires on its own; it is used as a
///   retry cooldown.
#[derive(Debug, Default)]
pub struct Status {
    failed: AtomicBool,
    warning: AtomicBool,
    error: Mutex<Option<MomentaryError>>,
}

impl Status {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Raise the warning flag. Returns `true` if it was not already set.
    pub fn set_warning(&self) -> bool {
        !self.warning.swap(true, Ordering::AcqRel)
    }

    pub fn clear_warning(&self) {
        self.warning.store(false, Ordering::Release);
    }

    pub fn has_warning(&self) -> bool {
        self.warning.load(Ordering::Acquire)
    }

    pub fn set_momentary_error(&self, name: &'static str, duration: Duration) {
        let mut error = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        *error = Some(MomentaryError {
            name,
            until: Instant::now() + duration,
        });
    }

    /// Name of the pending error, if it has not yet expired.
    pub fn error(&self) -> Option<&'static str> {
        let mut error = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        match error.as_ref() {
            Some(e) if Instant::now() < e.until => Some(e.name),
            Some(_) => {
                *error = None;
                None
            }
            None => None,
        }
    }

    pub fn has_error(&self) -> bool {
        self.error().is_some()
    }

    pub fn clear_error(&self) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
