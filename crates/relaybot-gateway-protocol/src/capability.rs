//! Capability levels — the ordered table of event-category bitmasks the
//! runtime negotiates against.
//!
//! Levels are ordered widest-first. Negotiation only ever narrows, one step
//! at a time, when the gateway rejects a handshake as unrecoverable; a wider
//! level is only tried again after a process restart picks up a wider
//! last-known-good index from the session store.

/// Event-category bits accepted by the gateway.
mod bits {
    pub const GUILDS: u64 = 1 << 0;
    pub const GUILD_MEMBERS: u64 = 1 << 1;
    pub const GUILD_MESSAGE_REACTIONS: u64 = 1 << 10;
    pub const DIRECT_MESSAGE: u64 = 1 << 12;
    pub const GROUP_AND_C2C_MESSAGES: u64 = 1 << 25;
    pub const INTERACTIONS: u64 = 1 << 26;
    pub const PUBLIC_GUILD_MESSAGES: u64 = 1 << 30;
}

/// One row of the capability table.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityLevel {
    pub name: &'static str,
    pub bitmask: u64,
    pub description: &'static str,
}

/// The negotiation table, widest permission set first.
pub const CAPABILITY_LEVELS: &[CapabilityLevel] = &[
    CapabilityLevel {
        name: "full",
        bitmask: bits::GUILDS
            | bits::GUILD_MEMBERS
            | bits::GUILD_MESSAGE_REACTIONS
            | bits::DIRECT_MESSAGE
            | bits::GROUP_AND_C2C_MESSAGES
            | bits::INTERACTIONS
            | bits::PUBLIC_GUILD_MESSAGES,
        description: "guild lifecycle, members, reactions, DMs, group/C2C, interactions",
    },
    CapabilityLevel {
        name: "standard",
        bitmask: bits::DIRECT_MESSAGE
            | bits::GROUP_AND_C2C_MESSAGES
            | bits::PUBLIC_GUILD_MESSAGES,
        description: "public guild messages, DMs, group/C2C",
    },
    CapabilityLevel {
        name: "minimal",
        bitmask: bits::GROUP_AND_C2C_MESSAGES,
        description: "group/C2C messages only",
    },
];

/// The level at `index`, clamped into the table.
pub fn level(index: usize) -> &'static CapabilityLevel {
    &CAPABILITY_LEVELS[index.min(CAPABILITY_LEVELS.len() - 1)]
}

/// The next-narrower index after `index`, if one exists.
pub fn narrower(index: usize) -> Option<usize> {
    let next = index + 1;
    (next < CAPABILITY_LEVELS.len()).then_some(next)
}

/// Index of the narrowest level in the table.
pub fn narrowest_index() -> usize {
    CAPABILITY_LEVELS.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_widest_first() {
        for pair in CAPABILITY_LEVELS.windows(2) {
            assert!(
                pair[0].bitmask.count_ones() > pair[1].bitmask.count_ones(),
                "{} should be wider than {}",
                pair[0].name,
                pair[1].name
            );
        }
    }

    #[test]
    fn every_level_receives_group_and_c2c() {
        for l in CAPABILITY_LEVELS {
            assert_ne!(l.bitmask & (1 << 25), 0, "{} must keep group/C2C", l.name);
        }
    }

    #[test]
    fn narrower_steps_once_and_stops() {
        assert_eq!(narrower(0), Some(1));
        assert_eq!(narrower(1), Some(2));
        assert_eq!(narrower(narrowest_index()), None);
    }

    #[test]
    fn level_clamps_out_of_range() {
        assert_eq!(level(usize::MAX).name, "minimal");
        assert_eq!(level(0).name, "full");
    }
}
