//! Small synchronization pieces shared by the timer tasks: a mutex-guarded slot the handle
//! writes and the task drains, and a drop-based stop signal so a task notices its handle is
//! gone even while the handle-holder is mid-transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub(super) struct SharedOption<T> {
    data: Arc<Mutex<Option<T>>>,
}

impl<T> SharedOption<T> {
    pub(super) fn new() -> Self {
        SharedOption {
            data: Arc::new(Mutex::new(None)),
        }
    }

    pub(super) fn replace(&self, new_data: T) {
        self.data
            .lock()
            .expect("SharedOption.replace() mutex guard poison")
            .replace(new_data);
    }

    pub(super) fn take(&self) -> Option<T> {
        self.data.lock().expect("SharedOption.take() mutex guard poison").take()
    }
}

pub(super) struct Stopper {
    stop_signal: Arc<AtomicBool>,
}

pub(super) struct StopCheck {
    stop_signal: Arc<AtomicBool>,
}

impl Drop for Stopper {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::Release);
    }
}

impl StopCheck {
    pub(super) fn should_stop(&self) -> bool {
        self.stop_signal.load(Ordering::Acquire)
    }
}

pub(super) fn stop_signal() -> (Stopper, StopCheck) {
    let stop_signal = Arc::new(AtomicBool::new(false));

    let stopper = Stopper {
        stop_signal: stop_signal.clone(),
    };
    let stop_check = StopCheck { stop_signal };

    (stopper, stop_check)
}
