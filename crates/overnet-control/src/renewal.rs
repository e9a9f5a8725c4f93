//! Certificate renewal timing.
//!
//! All times are unix seconds, matching certificate validity fields.

use std::time::Duration;

use overnet_core::Network;

/// When `network`'s certificate should next be renewed: immediately if the
/// alternate name no longer matches the subject, otherwise `lead` before
/// the certificate expires.
pub fn next_certificate_renew_time(network: &Network, lead: Duration, now: u64) -> u64 {
    if network.is_subject_mismatched() {
        return now;
    }
    network.certificate.not_after.saturating_sub(lead.as_secs())
}

pub fn is_renewal_due(network: &Network, lead: Duration, now: u64) -> bool {
    network.is_subject_mismatched() || now >= next_certificate_renew_time(network, lead, now)
}

/// The single renewal timer: a deadline recomputed after every processed
/// event, never earlier than `floor`.
#[derive(Debug, Clone)]
pub struct RenewalSchedule {
    lead: Duration,
    recheck_interval: Duration,
    floor: u64,
}

impl RenewalSchedule {
    pub fn new(lead: Duration, recheck_interval: Duration) -> Self {
        Self {
            lead,
            recheck_interval,
            floor: 0,
        }
    }

    pub fn lead(&self) -> Duration {
        self.lead
    }

    /// Next sweep time: the earliest renewal among `networks`, but not in
    /// the past and not before the recheck floor. `None` with no networks.
    pub fn deadline<'a>(
        &self,
        networks: impl IntoIterator<Item = &'a Network>,
        now: u64,
    ) -> Option<u64> {
        networks
            .into_iter()
            .map(|n| next_certificate_renew_time(n, self.lead, now))
            .min()
            .map(|next| next.max(now).max(self.floor))
    }

    /// Record a sweep at `now`. The next one waits at least one recheck interval.
    pub fn mark_swept(&mut self, now: u64) {
        self.floor = now.saturating_add(self.recheck_interval.as_secs());
    }
}
