//! Observers notified after every committed environment change.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use worldswap_common::EnvironmentId;

/// A committed change of the current environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentChange {
    pub current: EnvironmentId,
    pub previous: Option<EnvironmentId>,
}

pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Fire-and-forget listener. Errors and panics are logged and swallowed.
pub trait Observer: Send + Sync {
    fn on_environment_changed(&self, change: &EnvironmentChange) -> Result<(), ObserverError>;
}

impl<F> Observer for F
where
    F: Fn(&EnvironmentChange) -> Result<(), ObserverError> + Send + Sync,
{
    fn on_environment_changed(&self, change: &EnvironmentChange) -> Result<(), ObserverError> {
        self(change)
    }
}

/// Insertion-ordered observer set. Identity is the `Arc` allocation.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    observers: Arc<Mutex<Vec<Arc<dyn Observer>>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer. Registering the same `Arc` twice is a no-op.
    /// Returns whether it was added.
    pub fn register(&self, observer: Arc<dyn Observer>) -> bool {
        let mut observers = self.lock();
        if observers.iter().any(|o| same(o, &observer)) {
            return false;
        }
        observers.push(observer);
        true
    }

    pub fn unregister(&self, observer: &Arc<dyn Observer>) -> bool {
        let mut observers = self.lock();
        let before = observers.len();
        observers.retain(|o| !same(o, observer));
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Call every observer in registration order. Returns how many failed.
    ///
    /// Runs over a copy of the list, so observers may (un)register from inside
    /// their callback without deadlocking.
    pub fn notify_all(&self, change: &EnvironmentChange) -> usize {
        let observers: Vec<_> = self.lock().clone();
        let mut failures = 0;
        for (index, observer) in observers.iter().enumerate() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                observer.on_environment_changed(change)
            }));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!(index, environment = %change.current, "observer failed: {e}");
                }
                Err(_) => {
                    failures += 1;
                    tracing::warn!(index, environment = %change.current, "observer panicked");
                }
            }
        }
        failures
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn Observer>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("observers", &self.len())
            .finish()
    }
}

fn same(a: &Arc<dyn Observer>, b: &Arc<dyn Observer>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(to: &str) -> EnvironmentChange {
        EnvironmentChange {
            current: to.into(),
            previous: None,
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Arc<dyn Observer> {
        let log = log.clone();
        Arc::new(move |c: &EnvironmentChange| -> Result<(), ObserverError> {
            log.lock().unwrap().push(format!("{tag}:{}", c.current));
            Ok(())
        })
    }

    #[test]
    fn notifies_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = CallbackRegistry::new();
        registry.register(recorder(&log, "first"));
        registry.register(recorder(&log, "second"));

        assert_eq!(registry.notify_all(&change("arena1")), 0);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:arena1".to_string(), "second:arena1".to_string()]
        );
    }

    #[test]
    fn register_is_idempotent_per_identity() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = CallbackRegistry::new();
        let observer = recorder(&log, "x");
        assert!(registry.register(observer.clone()));
        assert!(!registry.register(observer.clone()));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(&observer));
        assert!(!registry.unregister(&observer));
        assert!(registry.is_empty());
    }

    #[test]
    fn failing_observer_does_not_block_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = CallbackRegistry::new();
        registry.register(Arc::new(|_: &EnvironmentChange| -> Result<(), ObserverError> {
            Err("boom".into())
        }));
        registry.register(Arc::new(|_: &EnvironmentChange| -> Result<(), ObserverError> {
            panic!("observer bug")
        }));
        registry.register(recorder(&log, "ok"));

        assert_eq!(registry.notify_all(&change("arena2")), 2);
        assert_eq!(*log.lock().unwrap(), vec!["ok:arena2".to_string()]);
    }

    #[test]
    fn observer_may_unregister_itself() {
        let registry = CallbackRegistry::new();
        let slot: Arc<Mutex<Option<Arc<dyn Observer>>>> = Arc::new(Mutex::new(None));
        let inner_registry = registry.clone();
        let inner_slot = slot.clone();
        let observer: Arc<dyn Observer> =
            Arc::new(move |_: &EnvironmentChange| -> Result<(), ObserverError> {
                if let Some(me) = inner_slot.lock().unwrap().take() {
                    inner_registry.unregister(&me);
                }
                Ok(())
            });
        *slot.lock().unwrap() = Some(observer.clone());
        registry.register(observer);

        registry.notify_all(&change("a"));
        assert!(registry.is_empty());
    }
}
