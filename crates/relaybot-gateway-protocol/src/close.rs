//! Close-code classification.
//!
//! The gateway signals why it hung up through the WebSocket close code.
//! The classification below decides what the next connection attempt looks
//! like; the reconnect loop in the runtime acts on the disposition.

/// What a close code means for the next connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Clean shutdown requested by the server. No reconnect.
    Normal,
    /// The session survived; the next attempt should resume it.
    Resume,
    /// Server-side internal error. Reconnect with a fresh identify and
    /// discard the stored session.
    Reidentify,
    /// The account is offline or sandbox-restricted. Stop permanently.
    AccountOffline,
    /// The account is banned. Stop permanently.
    AccountBanned,
    /// Unclassified abnormal close; standard backoff reconnect.
    Retry,
}

impl CloseDisposition {
    /// Whether this disposition ends the supervisor for good.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::AccountOffline | Self::AccountBanned)
    }
}

/// Classify a WebSocket close code from the gateway.
pub fn classify_close(code: u16) -> CloseDisposition {
    match code {
        1000 => CloseDisposition::Normal,
        4009 => CloseDisposition::Resume,
        4900..=4913 => CloseDisposition::Reidentify,
        4914 => CloseDisposition::AccountOffline,
        4915 => CloseDisposition::AccountBanned,
        _ => CloseDisposition::Retry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_close_does_not_reconnect() {
        assert_eq!(classify_close(1000), CloseDisposition::Normal);
    }

    #[test]
    fn session_timeout_resumes() {
        assert_eq!(classify_close(4009), CloseDisposition::Resume);
    }

    #[test]
    fn internal_error_band_reidentifies() {
        assert_eq!(classify_close(4900), CloseDisposition::Reidentify);
        assert_eq!(classify_close(4906), CloseDisposition::Reidentify);
        assert_eq!(classify_close(4913), CloseDisposition::Reidentify);
    }

    #[test]
    fn offline_account_is_fatal() {
        let d = classify_close(4914);
        assert_eq!(d, CloseDisposition::AccountOffline);
        assert!(d.is_fatal());
    }

    #[test]
    fn banned_account_is_fatal() {
        let d = classify_close(4915);
        assert_eq!(d, CloseDisposition::AccountBanned);
        assert!(d.is_fatal());
    }

    #[test]
    fn unknown_codes_retry() {
        assert_eq!(classify_close(1006), CloseDisposition::Retry);
        assert_eq!(classify_close(4000), CloseDisposition::Retry);
        assert_eq!(classify_close(4916), CloseDisposition::Retry);
    }

    #[test]
    fn retry_is_not_fatal() {
        assert!(!CloseDisposition::Retry.is_fatal());
        assert!(!CloseDisposition::Resume.is_fatal());
        assert!(!CloseDisposition::Normal.is_fatal());
    }
}
