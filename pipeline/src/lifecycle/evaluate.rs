//! Dry-run evaluation of a lifecycle policy.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use super::backend::RemoteImage;
use super::policy::{CountType, LifecyclePolicy};

/// An image the policy would expire, and the rule that claims it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiringImage {
    pub image: RemoteImage,
    pub rule_priority: u32,
}

/// Images `policy` would expire at `now`, oldest first.
///
/// Rules run in ascending priority. An image selected by a rule is claimed by
/// it, whether kept or expired, and is not seen by later rules.
pub fn evaluate(
    policy: &LifecyclePolicy,
    images: &[RemoteImage],
    now: DateTime<Utc>,
) -> Vec<ExpiringImage> {
    let mut claimed: HashSet<&str> = HashSet::new();
    let mut expiring = Vec::new();

    for rule in policy.ordered_rules() {
        let mut candidates: Vec<&RemoteImage> = images
            .iter()
            .filter(|image| !claimed.contains(image.digest.as_str()))
            .filter(|image| rule.selects(&image.tags))
            .collect();
        // newest first
        candidates.sort_by(|a, b| {
            b.pushed_at
                .cmp(&a.pushed_at)
                .then_with(|| a.digest.cmp(&b.digest))
        });

        let count = rule.selection.count_number;
        let expired: Vec<&RemoteImage> = match rule.selection.count_type {
            CountType::ImageCountMoreThan => {
                candidates.iter().skip(count as usize).copied().collect()
            }
            CountType::SinceImagePushed => {
                let cutoff = now - Duration::days(i64::from(count));
                candidates
                    .iter()
                    .filter(|image| image.pushed_at < cutoff)
                    .copied()
                    .collect()
            }
        };

        tracing::debug!(
            priority = rule.rule_priority,
            selected = candidates.len(),
            expiring = expired.len(),
            "Evaluated lifecycle rule"
        );

        claimed.extend(candidates.iter().map(|image| image.digest.as_str()));
        expiring.extend(expired.into_iter().map(|image| ExpiringImage {
            image: image.clone(),
            rule_priority: rule.rule_priority,
        }));
    }

    expiring.sort_by(|a, b| {
        a.image
            .pushed_at
            .cmp(&b.image.pushed_at)
            .then_with(|| a.image.digest.cmp(&b.image.digest))
    });
    expiring
}
