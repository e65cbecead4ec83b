use std::sync::{Mutex, MutexGuard};

/// Tests that touch process environment variables hold this lock.
static ENV_LOCK: Mutex<()> = Mutex::new(());

pub fn lock_env() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
