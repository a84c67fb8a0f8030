use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::ModelFamily;

/// One upstream account.
///
/// Timestamps are Unix milliseconds. `rate_limits` holds, per model family,
/// the moment the account may be used again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub identity: String,
    pub access_token: String,
    pub refresh_token: String,
    pub project_id: String,
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub rate_limits: HashMap<ModelFamily, i64>,
}

impl Credential {
    pub fn new(
        identity: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        project_id: impl Into<String>,
        expires_at: i64,
    ) -> Self {
        Self {
            identity: identity.into(),
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            project_id: project_id.into(),
            expires_at,
            tier: None,
            rate_limits: HashMap::new(),
        }
    }

    /// End of the cool-down for `family`, if one is still running.
    pub fn limited_until(&self, family: ModelFamily, now_ms: i64) -> Option<i64> {
        self.rate_limits
            .get(&family)
            .copied()
            .filter(|until| *until > now_ms)
    }

    pub fn is_limited_for(&self, family: ModelFamily, now_ms: i64) -> bool {
        self.limited_until(family, now_ms).is_some()
    }

    /// The access token is inside the safety buffer before expiry.
    pub fn needs_refresh(&self, now_ms: i64, buffer: Duration) -> bool {
        now_ms >= self.expires_at.saturating_sub(duration_ms(buffer))
    }

    /// Start a cool-down for `family`; elapsed entries are dropped.
    pub fn mark_limited(&mut self, family: ModelFamily, now_ms: i64, retry_after: Duration) {
        self.rate_limits.retain(|_, until| *until > now_ms);
        self.rate_limits
            .insert(family, now_ms.saturating_add(duration_ms(retry_after)));
    }
}

pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_are_per_family() {
        let mut cred = Credential::new("a@example.com", "at", "rt", "proj", 0);
        cred.mark_limited(ModelFamily::Gemini, 1_000, Duration::from_millis(5_000));

        assert!(cred.is_limited_for(ModelFamily::Gemini, 1_000));
        assert!(!cred.is_limited_for(ModelFamily::Claude, 1_000));
        assert_eq!(cred.limited_until(ModelFamily::Gemini, 2_000), Some(6_000));
        assert!(!cred.is_limited_for(ModelFamily::Gemini, 6_000));
    }

    #[test]
    fn test_huge_delay_saturates() {
        let mut cred = Credential::new("a", "at", "rt", "proj", 0);
        cred.mark_limited(ModelFamily::Claude, 1_000, Duration::MAX);
        assert_eq!(cred.limited_until(ModelFamily::Claude, 1_000), Some(i64::MAX));
        assert!(cred.is_limited_for(ModelFamily::Claude, i64::MAX - 1));
    }

    #[test]
    fn test_refresh_window() {
        let cred = Credential::new("a", "at", "rt", "proj", 600_000);
        let buffer = Duration::from_secs(300);
        assert!(!cred.needs_refresh(299_999, buffer));
        assert!(cred.needs_refresh(300_000, buffer));
    }

    #[test]
    fn test_serialized_shape() {
        let mut cred = Credential::new("a@example.com", "at", "rt", "proj", 42);
        cred.mark_limited(ModelFamily::Claude, 0, Duration::from_secs(1));
        let value = serde_json::to_value(&cred).unwrap();
        assert_eq!(value["projectId"], "proj");
        assert_eq!(value["expiresAt"], 42);
        assert_eq!(value["rateLimits"]["claude"], 1000);
        let back: Credential = serde_json::from_value(value).unwrap();
        assert_eq!(back, cred);
    }
}
