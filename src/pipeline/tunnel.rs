use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::config::TunnelConfig;
use crate::error::BootstrapError;
use crate::phase::PhaseContext;

/// Port-forwards opened during a run, keyed by target.
///
/// A tunnel is released through the run's [`ResourceGuard`](crate::guard::ResourceGuard):
/// opened inside a phase it closes when the phase ends, opened by a
/// precondition it lives until the run exits.
#[derive(Clone, Default)]
pub struct Tunnels {
    open: Arc<Mutex<BTreeSet<String>>>,
}

fn key(tunnel: &TunnelConfig) -> String {
    format!(
        "{}/{}:{}->{}",
        tunnel.namespace, tunnel.service, tunnel.local_port, tunnel.remote_port
    )
}

impl Tunnels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `tunnel` unless it is already up.
    pub fn ensure(&self, ctx: &PhaseContext, tunnel: &TunnelConfig) -> Result<(), BootstrapError> {
        let key = key(tunnel);
        if !self.lock().insert(key.clone()) {
            debug!(tunnel = %key, "tunnel already open");
            return Ok(());
        }

        let handle = match ctx.platform.cluster.port_forward(
            &tunnel.namespace,
            &tunnel.service,
            tunnel.local_port,
            tunnel.remote_port,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.lock().remove(&key);
                return Err(e.into());
            }
        };
        info!(tunnel = %key, pid = ?handle.id(), "tunnel opened");

        let open = self.open.clone();
        let label = format!("port-forward {key}");
        ctx.guard.register(label, move || {
            open.lock().unwrap_or_else(|p| p.into_inner()).remove(&key);
            handle.stop()
        });
        Ok(())
    }

    pub fn is_open(&self, tunnel: &TunnelConfig) -> bool {
        self.lock().contains(&key(tunnel))
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.open.lock().unwrap_or_else(|p| p.into_inner())
    }
}
