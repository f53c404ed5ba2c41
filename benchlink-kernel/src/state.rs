use parking_lot::Mutex;
use std::sync::Arc;

/// État partagé entre la façade et les tâches (verrou court, jamais tenu
/// pendant une I/O)
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
