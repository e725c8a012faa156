use std::time::Duration;

/// Knobs for a single call attempt.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Public STUN addresses used for candidate discovery. There is no
    /// TURN fallback; both peers behind symmetric NAT is an accepted
    /// limitation.
    pub ice_servers: Vec<String>,
    /// How long an outgoing call may sit unanswered before it is torn down.
    pub dial_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
                "stun:stun2.l.google.com:19302".into(),
                "stun:stun3.l.google.com:19302".into(),
            ],
            dial_timeout: Duration::from_secs(30),
        }
    }
}
