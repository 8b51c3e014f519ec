use std::collections::BTreeMap;
use std::sync::Mutex;

use zeroize::Zeroize;

/// Key-value target that exported credentials are written to.
///
/// The infra-as-code engine reads its inputs from the process environment, so
/// [`ProcessEnv`] is the production sink; tests swap in [`MapSink`].
pub trait EnvSink: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
    fn set(&self, name: &str, value: &str);
    fn unset(&self, name: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSink for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn set(&self, name: &str, value: &str) {
        // SAFETY: sound only while no other thread reads or writes the
        // environment. std readers are serialized with this call; C code calling
        // `getenv` (libgit2, `getaddrinfo` on tokio's blocking pool) is not.
        // Exports and wipes run on the orchestrator task between awaits, never
        // while it waits on a lookup; a lookup abandoned by a timeout can still
        // be running on the blocking pool. Tests hold `testing::process_env_lock`.
        unsafe { std::env::set_var(name, value) }
    }

    fn unset(&self, name: &str) {
        // SAFETY: see `set`.
        unsafe { std::env::remove_var(name) }
    }
}

/// In-memory sink; removed values are zeroized.
#[derive(Debug, Default)]
pub struct MapSink {
    vars: Mutex<BTreeMap<String, String>>,
}

impl MapSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vars.lock().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EnvSink for MapSink {
    fn get(&self, name: &str) -> Option<String> {
        self.vars.lock().ok()?.get(name).cloned()
    }

    fn set(&self, name: &str, value: &str) {
        if let Ok(mut vars) = self.vars.lock() {
            if let Some(mut old) = vars.insert(name.to_string(), value.to_string()) {
                old.zeroize();
            }
        }
    }

    fn unset(&self, name: &str) {
        if let Ok(mut vars) = self.vars.lock() {
            if let Some(mut old) = vars.remove(name) {
                old.zeroize();
            }
        }
    }
}
