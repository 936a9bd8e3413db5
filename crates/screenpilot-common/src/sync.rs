use std::sync::Mutex;
use std::sync::MutexGuard;

pub fn mutex_lock_or_recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        eprintln!("Warning: recovering from poisoned mutex");
        poisoned.into_inner()
    })
}
