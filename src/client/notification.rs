//! Renewal notifications.

use crate::cert::chain::SerialId;
use crate::error::{PkiError, Result};

/// Receives a callback after a component's certificate has been renewed and
/// the new identity is live.
///
/// Listeners run in registration order on the renewing task. An error or
/// panic in one listener is logged and does not stop the others.
pub trait CertificateNotification: Send + Sync {
    fn notify_certificate_renewed(
        &self,
        component: &str,
        old_serial: Option<&SerialId>,
        new_serial: &SerialId,
    ) -> Result<()>;
}

/// Told when renewal keeps failing.
pub trait HealthReporter: Send + Sync {
    fn renewal_failing(&self, component: &str, consecutive_failures: u32, last_error: &PkiError);
}
