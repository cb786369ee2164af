use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

/// What a worker does when a task callable panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanicStrategy {
    /// Abort the process.
    Abort,
    /// Convert the panic into a task error and keep the worker alive.
    #[default]
    Capture,
}

#[derive(Debug)]
pub struct PanicHandler {
    strategy: PanicStrategy,
    panic_count: AtomicUsize,
}

impl PanicHandler {
    pub fn new(strategy: PanicStrategy) -> Self {
        Self {
            strategy,
            panic_count: AtomicUsize::new(0),
        }
    }

    /// Run `f`, returning the panic message if it unwinds.
    pub fn execute<F, R>(&self, f: F) -> Result<R, String>
    where
        F: FnOnce() -> R,
    {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => Ok(result),
            Err(payload) => {
                self.panic_count.fetch_add(1, Ordering::Relaxed);
                let message = payload_message(&*payload);

                if self.strategy == PanicStrategy::Abort {
                    tracing::error!(%message, "task panicked, aborting");
                    std::process::abort();
                }

                Err(message)
            }
        }
    }

    pub fn panic_count(&self) -> usize {
        self.panic_count.load(Ordering::Relaxed)
    }

    pub fn strategy(&self) -> PanicStrategy {
        self.strategy
    }
}

impl Default for PanicHandler {
    fn default() -> Self {
        Self::new(PanicStrategy::default())
    }
}

pub(crate) fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_captured() {
        let handler = PanicHandler::new(PanicStrategy::Capture);

        let result = handler.execute(|| {
            panic!("test panic");
        });

        assert_eq!(result.unwrap_err(), "test panic");
        assert_eq!(handler.panic_count(), 1);
    }

    #[test]
    fn test_success_passes_through() {
        let handler = PanicHandler::default();
        assert_eq!(handler.execute(|| 42).unwrap(), 42);
        assert_eq!(handler.panic_count(), 0);
    }

    #[test]
    fn test_formatted_message() {
        let handler = PanicHandler::default();
        for i in 0..3 {
            let err = handler.execute(|| panic!("failure {}", i)).unwrap_err();
            assert_eq!(err, format!("failure {}", i));
        }
        assert_eq!(handler.panic_count(), 3);
    }
}
