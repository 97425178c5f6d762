//! Seam to the on-device enforcement collaborator.

use timebank_database::UnlockedSession;

/// Callback surface for the platform policy layer that actually blocks or
/// allows apps. This core only reports session boundaries; it never toggles
/// device policy itself.
pub trait EnforcementSink: Send + Sync {
    /// A session started: restrictions are lifted for its duration.
    fn restrictions_lifted(&self, session: &UnlockedSession);

    /// A session ended via expiry or cancellation: restrictions re-apply.
    fn restrictions_restored(&self, session: &UnlockedSession);
}

/// No-op sink for tests and headless assemblies.
pub struct NoopEnforcement;

impl EnforcementSink for NoopEnforcement {
    fn restrictions_lifted(&self, _session: &UnlockedSession) {}
    fn restrictions_restored(&self, _session: &UnlockedSession) {}
}
