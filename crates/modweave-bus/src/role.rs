use modweave_api::content_hash;
use modweave_protocol::IdRange;

/// The three participants of the transport. Each role owns a disjoint
/// correlation-id band and a stable signature derived from its name, so
/// a context can recognize (and drop) its own broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextRole {
    /// Privileged controller: owns the registry and the persistent state.
    Controller,
    /// Page-adjacent relay between the controller and the page.
    Relay,
    /// Page-injected runtime hosting running mods.
    Agent,
}

impl ContextRole {
    pub fn name(self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Relay => "relay",
            Self::Agent => "agent",
        }
    }

    /// Correlation-id band. Bands never overlap; an id identifies its
    /// allocating role on the wire.
    pub fn id_range(self) -> IdRange {
        match self {
            Self::Agent => IdRange::new(1_000, 500_000),
            Self::Relay => IdRange::new(500_000, 1_000_000),
            Self::Controller => IdRange::new(1_000_000, 1_500_000),
        }
    }

    pub fn signature(self) -> i32 {
        content_hash(self.name().as_bytes())
    }
}
