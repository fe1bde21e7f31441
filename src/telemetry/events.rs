use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
#[serde(tag = "event_type")]
pub enum SyncEvent {
    ModeActivated {
        mode: String,
        namespace: String,
    },
    ModeDeactivated {
        namespace: String,
        subscriptions_closed: usize,
    },
    SharedCanvasJoined {
        canvas_id: String,
        role: String,
        token_redacted: String,
    },
    SnapshotRefreshed {
        namespace: String,
        collection: String,
        entities: usize,
        buffered_applied: usize,
        buffered_skipped: usize,
    },
    SnapshotRefreshFailed {
        namespace: String,
        collection: String,
        reason: String,
    },
    CacheWritten {
        namespace: String,
        notes: usize,
        images: usize,
        files: usize,
        fallback_truncated: bool,
    },
    CacheWriteSkipped {
        namespace: String,
        reason: String,
    },
    QuotaExceeded {
        namespace: String,
        tier: String,
    },
    ImageCacheEvicted {
        removed: u64,
        retention_days: u32,
    },
}

/// Keeps only enough of a share token to correlate log lines.
pub fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.chars().count() <= 8 {
        return "***".to_string();
    }
    let prefix: String = trimmed.chars().take(4).collect();
    format!("{prefix}***")
}

impl SyncEvent {
    pub fn log(&self) {
        let event_json = serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self));
        info!(
            target: "sync_events",
            event = %event_json,
            "Sync event occurred"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{SyncEvent, redact_token};

    #[test]
    fn redacts_long_token() {
        assert_eq!(redact_token("abcd1234efgh"), "abcd***");
    }

    #[test]
    fn redacts_short_token_completely() {
        assert_eq!(redact_token("abc"), "***");
    }

    #[test]
    fn redacts_empty_value() {
        assert_eq!(redact_token(""), "***");
    }

    #[test]
    fn serializes_with_event_type_tag() {
        let event = SyncEvent::QuotaExceeded {
            namespace: "local".to_string(),
            tier: "fallback".to_string(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["event_type"], "QuotaExceeded");
    }
}
