//! Process environment overrides shared by the configuration tests.

use std::ffi::{OsStr, OsString};
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Holds the environment lock and restores every variable it set on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Takes the environment lock and clears any inherited `TETHER_*`
    /// variables for the guard's lifetime.
    pub fn acquire() -> Self {
        let lock = ENV_MUTEX
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut guard = Self {
            previous: Vec::new(),
            _lock: lock,
        };
        let inherited: Vec<String> = std::env::vars_os()
            .filter_map(|(key, _)| key.into_string().ok())
            .filter(|key| key.starts_with("TETHER_"))
            .collect();
        for key in inherited {
            guard.remember(&key);
            // Environment mutation is `unsafe` in edition 2024; the mutex
            // keeps other tests in this binary from observing it.
            unsafe { std::env::remove_var(&key) };
        }
        guard
    }

    /// Sets `key` until the guard drops.
    pub fn set(&mut self, key: &str, value: impl AsRef<OsStr>) {
        self.remember(key);
        unsafe { std::env::set_var(key, value) };
    }

    fn remember(&mut self, key: &str) {
        if self.previous.iter().all(|(known, _)| known != key) {
            self.previous.push((key.to_owned(), std::env::var_os(key)));
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        while let Some((key, value)) = self.previous.pop() {
            match value {
                Some(value) => unsafe { std::env::set_var(&key, value) },
                None => unsafe { std::env::remove_var(&key) },
            }
        }
    }
}
