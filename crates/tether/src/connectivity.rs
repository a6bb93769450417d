//! Connectivity probe.
//!
//! The probe itself belongs to the host (platform network APIs, a ping
//! endpoint, ...). The pipeline only asks whether the device is online.

use async_trait::async_trait;

#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Probe that always reports online. The default when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

#[async_trait]
impl Connectivity for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}
