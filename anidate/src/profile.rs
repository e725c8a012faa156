use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{error::Error, signal::ParticipantId};

/// Minimal view of a profile, enough to render a call prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: ParticipantId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// Resolves participant ids to displayable profiles. A caller identity must
/// be resolvable before the user is interrupted with a prompt.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn get_profile(&self, id: &ParticipantId) -> Result<Profile, Error>;
}
