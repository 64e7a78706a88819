// Provider router - chooses local vs. external execution per capability
//
// Policy comes from the run's snapshotted privacy mode:
// - LocalOnly: always local, ModelUnavailable if no local provider
// - ExternalOnly: always external, ExternalRequired if unconfigured
// - PreferExternal: external first, local fallback marks the run degraded
//
// Router state is per run. After enough consecutive external failures the
// circuit opens and the rest of the run routes straight to local (or fails,
// per mode) instead of paying a timeout on every window.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use super::errors::{DiarizationError, Result};
use super::providers::ProviderRegistry;
use super::types::{Capability, PrivacyMode};

/// Where a capability call should execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTarget {
    Local,
    External,
}

/// Per-run provider router with circuit-breaker state
pub struct ProviderRouter {
    privacy_mode: PrivacyMode,
    registry: Arc<ProviderRegistry>,
    breaker_threshold: u32,
    consecutive_failures: AtomicU32,
    circuit_open: AtomicBool,
    degraded: AtomicBool,
}

impl ProviderRouter {
    pub fn new(
        privacy_mode: PrivacyMode,
        registry: Arc<ProviderRegistry>,
        breaker_threshold: u32,
    ) -> Self {
        debug!("Router created with privacy mode {:?}", privacy_mode);
        Self {
            privacy_mode,
            registry,
            breaker_threshold: breaker_threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
            circuit_open: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
        }
    }

    /// Choose the execution target for one capability call
    pub fn select(&self, capability: Capability) -> Result<ExecutionTarget> {
        match self.privacy_mode {
            PrivacyMode::LocalOnly => {
                if self.registry.has_local(capability) {
                    Ok(ExecutionTarget::Local)
                } else {
                    Err(DiarizationError::ModelUnavailable {
                        capability,
                        reason: "privacy mode is local-only and no local provider is installed"
                            .to_string(),
                    })
                }
            }
            PrivacyMode::ExternalOnly => {
                if !self.registry.has_external(capability) {
                    return Err(DiarizationError::ExternalRequired {
                        capability,
                        reason: "no credentials or endpoint configured in environment".to_string(),
                    });
                }
                if self.circuit_open.load(Ordering::SeqCst) {
                    // No fallback by design; the capability is unusable for
                    // the rest of this run
                    return Err(DiarizationError::ModelUnavailable {
                        capability,
                        reason: format!(
                            "external provider disabled after {} consecutive failures",
                            self.breaker_threshold
                        ),
                    });
                }
                Ok(ExecutionTarget::External)
            }
            PrivacyMode::PreferExternal => {
                if self.registry.has_external(capability) && !self.circuit_open.load(Ordering::SeqCst)
                {
                    return Ok(ExecutionTarget::External);
                }
                if self.registry.has_local(capability) {
                    // Either external is unconfigured or the circuit is open;
                    // both are observable as a degraded run
                    self.mark_degraded();
                    return Ok(ExecutionTarget::Local);
                }
                Err(DiarizationError::ModelUnavailable {
                    capability,
                    reason: "external provider unavailable and no local provider installed"
                        .to_string(),
                })
            }
        }
    }

    /// Record a failed external call; opens the circuit at the threshold
    pub fn record_external_failure(&self, capability: Capability) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            "External {} failure {}/{}",
            capability, failures, self.breaker_threshold
        );
        self.mark_degraded();

        if failures >= self.breaker_threshold && !self.circuit_open.swap(true, Ordering::SeqCst) {
            info!(
                "Circuit breaker opened for external providers after {} consecutive failures",
                failures
            );
        }
    }

    /// Record a successful external call; resets the consecutive count
    pub fn record_external_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Mark the run degraded (external fallback happened)
    pub fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::SeqCst);
    }

    /// Whether the run has fallen back from its preferred provider
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Whether the external circuit is open for the rest of this run
    pub fn is_circuit_open(&self) -> bool {
        self.circuit_open.load(Ordering::SeqCst)
    }

    pub fn privacy_mode(&self) -> PrivacyMode {
        self.privacy_mode
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }
}
