use std::time::Duration;

use uuid::Uuid;

use crate::types::PairingChallenge;

/// Issues and tracks the single outstanding pairing challenge.
///
/// Only the most recent challenge is remembered, so a superseded token can
/// never be consumed.
#[derive(Debug, Clone)]
pub struct PairingHandler {
    timeout_ms: u64,
    current: Option<PairingChallenge>,
}

impl PairingHandler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout_ms: timeout.as_millis() as u64,
            current: None,
        }
    }

    /// Issue a fresh challenge, discarding any previous one.
    pub fn issue_challenge(&mut self, now_ms: u64) -> PairingChallenge {
        let challenge = PairingChallenge {
            token: Uuid::new_v4().simple().to_string(),
            issued_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(self.timeout_ms),
            consumed: false,
        };
        self.current = Some(challenge.clone());
        challenge
    }

    /// Reuse the live challenge when there is one, otherwise issue a new one.
    ///
    /// The flag is `true` when a new challenge was issued.
    pub fn current_or_issue(&mut self, now_ms: u64) -> (PairingChallenge, bool) {
        match self.live_challenge(now_ms) {
            Some(challenge) => (challenge.clone(), false),
            None => (self.issue_challenge(now_ms), true),
        }
    }

    /// Most recent challenge, live or not.
    pub fn current(&self) -> Option<&PairingChallenge> {
        self.current.as_ref()
    }

    /// The challenge that may still be consumed at `now_ms`.
    pub fn live_challenge(&self, now_ms: u64) -> Option<&PairingChallenge> {
        self.current
            .as_ref()
            .filter(|challenge| challenge.is_live(now_ms))
    }

    /// Mark `token` consumed. Succeeds at most once per token.
    pub fn consume(&mut self, token: &str, now_ms: u64) -> bool {
        let Some(challenge) = self.current.as_mut() else {
            return false;
        };
        if challenge.token != token || !challenge.is_live(now_ms) {
            return false;
        }
        challenge.consumed = true;
        true
    }

    /// Drop `token` when its expiry timer fires.
    ///
    /// Returns `false` when the token was already superseded or consumed.
    pub fn expire(&mut self, token: &str) -> bool {
        let matches = self
            .current
            .as_ref()
            .is_some_and(|challenge| challenge.token == token && !challenge.consumed);
        if matches {
            self.current = None;
        }
        matches
    }

    /// Forget the current challenge.
    pub fn invalidate(&mut self) -> Option<PairingChallenge> {
        self.current.take()
    }
}

impl Default for PairingHandler {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuing_supersedes_previous_challenge() {
        let mut handler = PairingHandler::new(Duration::from_secs(30));
        let first = handler.issue_challenge(0);
        let second = handler.issue_challenge(1_000);

        assert_ne!(first.token, second.token);
        assert!(!handler.consume(&first.token, 1_500));
        assert_eq!(
            handler.live_challenge(1_500).map(|c| c.token.as_str()),
            Some(second.token.as_str())
        );
    }

    #[test]
    fn consume_succeeds_exactly_once() {
        let mut handler = PairingHandler::default();
        let challenge = handler.issue_challenge(0);

        assert!(handler.consume(&challenge.token, 10));
        assert!(!handler.consume(&challenge.token, 20));
        assert!(handler.live_challenge(20).is_none());
    }

    #[test]
    fn expired_challenge_cannot_be_consumed() {
        let mut handler = PairingHandler::new(Duration::from_millis(30_000));
        let challenge = handler.issue_challenge(0);
        assert_eq!(challenge.expires_at_ms, 30_000);

        assert!(!handler.consume(&challenge.token, 30_000));
        assert!(handler.live_challenge(30_000).is_none());
    }

    #[test]
    fn expiry_timer_only_drops_matching_unconsumed_token() {
        let mut handler = PairingHandler::default();
        let stale = handler.issue_challenge(0);
        let fresh = handler.issue_challenge(5);

        assert!(!handler.expire(&stale.token));
        assert!(handler.current().is_some());

        assert!(handler.expire(&fresh.token));
        assert!(handler.current().is_none());

        let consumed = handler.issue_challenge(10);
        assert!(handler.consume(&consumed.token, 11));
        assert!(!handler.expire(&consumed.token));
    }

    #[test]
    fn current_or_issue_reuses_live_challenge() {
        let mut handler = PairingHandler::new(Duration::from_secs(30));
        let (first, issued) = handler.current_or_issue(0);
        assert!(issued);

        let (again, issued_again) = handler.current_or_issue(10_000);
        assert!(!issued_again);
        assert_eq!(again.token, first.token);

        let (after_expiry, reissued) = handler.current_or_issue(30_000);
        assert!(reissued);
        assert_ne!(after_expiry.token, first.token);
    }

    #[test]
    fn at_most_one_live_challenge() {
        let mut handler = PairingHandler::new(Duration::from_secs(30));
        let mut tokens = Vec::new();
        for step in 0..5 {
            tokens.push(handler.issue_challenge(step * 100).token);
        }
        let live: Vec<_> = tokens
            .iter()
            .filter(|token| {
                handler
                    .live_challenge(500)
                    .is_some_and(|challenge| &challenge.token == *token)
            })
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0], tokens.last().expect("tokens were issued"));
    }
}
