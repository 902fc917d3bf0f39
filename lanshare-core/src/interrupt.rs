//! Cooperative stop signal polled by the blocking service loops.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Shared stop flag, optionally backed by a host predicate.
///
/// Loops check it at least once per poll interval. Once the predicate answers true the
/// flag latches, so every clone observes the stop even if the predicate later flips back.
#[derive(Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
    predicate: Option<Predicate>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt driven by `predicate`, e.g. a host "should stop?" callback.
    pub fn from_fn<F>(predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            predicate: Some(Arc::new(predicate)),
        }
    }

    /// Fires when either `self` or `other` fires.
    pub fn or(&self, other: &Interrupt) -> Interrupt {
        let a = self.clone();
        let b = other.clone();
        Interrupt::from_fn(move || a.is_triggered() || b.is_triggered())
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.predicate {
            Some(p) if p() => {
                self.flag.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupt")
            .field("triggered", &self.flag.load(Ordering::SeqCst))
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}
