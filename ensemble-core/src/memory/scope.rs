//! Memory scope naming.
//!
//! A scope isolates one participant's memories within a world, or holds the
//! memories every participant of a world shares. Names are derived purely
//! from ids so that vectorization and retrieval always agree.

use crate::model::{ParticipantId, WorldId};
use std::fmt;
use std::str::FromStr;

use super::MemoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryScope {
    /// `world_{W}_char_{C}`
    Participant {
        world_id: WorldId,
        participant_id: ParticipantId,
    },
    /// `world_{W}_multi`
    Shared { world_id: WorldId },
}

impl MemoryScope {
    pub fn participant(world_id: WorldId, participant_id: ParticipantId) -> Self {
        MemoryScope::Participant {
            world_id,
            participant_id,
        }
    }

    pub fn shared(world_id: WorldId) -> Self {
        MemoryScope::Shared { world_id }
    }

    pub fn world_id(&self) -> WorldId {
        match self {
            MemoryScope::Participant { world_id, .. } | MemoryScope::Shared { world_id } => {
                *world_id
            }
        }
    }

    pub fn participant_id(&self) -> Option<ParticipantId> {
        match self {
            MemoryScope::Participant { participant_id, .. } => Some(*participant_id),
            MemoryScope::Shared { .. } => None,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, MemoryScope::Shared { .. })
    }
}

impl fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryScope::Participant {
                world_id,
                participant_id,
            } => write!(f, "world_{world_id}_char_{participant_id}"),
            MemoryScope::Shared { world_id } => write!(f, "world_{world_id}_multi"),
        }
    }
}

impl FromStr for MemoryScope {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MemoryError::InvalidScope(s.to_string());

        let rest = s.strip_prefix("world_").ok_or_else(invalid)?;
        let (world, tail) = rest.split_once('_').ok_or_else(invalid)?;
        let world_id: WorldId = world.parse().map_err(|_| invalid())?;

        if tail == "multi" {
            return Ok(MemoryScope::shared(world_id));
        }
        let participant = tail.strip_prefix("char_").ok_or_else(invalid)?;
        let participant_id: ParticipantId = participant.parse().map_err(|_| invalid())?;
        Ok(MemoryScope::participant(world_id, participant_id))
    }
}
