use crate::wire::InvKind;
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Kind {
    Block,
    Tx,
    Proof,
    Contender,
}

impl From<InvKind> for Kind {
    fn from(kind: InvKind) -> Self {
        match kind {
            InvKind::Block => Self::Block,
            InvKind::Tx => Self::Tx,
            InvKind::Proof => Self::Proof,
            InvKind::Contender => Self::Contender,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Item {
    pub kind: Kind,
}

impl Item {
    pub fn new(kind: InvKind) -> Self {
        Self { kind: kind.into() }
    }
}

/// Processor metrics.
#[derive(Clone, Default)]
pub struct Metrics {
    pub polls: Counter,
    pub responses: Counter,
    pub timeouts: Counter,
    pub misbehaviors: Counter,
    pub votes: Family<Item, Counter>,
    pub finalized: Family<Item, Counter>,
    pub invalidated: Family<Item, Counter>,
    pub records: Gauge,
    pub quorum: Gauge,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register("polls", "polls sent", metrics.polls.clone());
        registry.register("responses", "valid responses received", metrics.responses.clone());
        registry.register("timeouts", "polls that timed out", metrics.timeouts.clone());
        registry.register(
            "misbehaviors",
            "protocol violations by remote nodes",
            metrics.misbehaviors.clone(),
        );
        registry.register("votes", "votes folded into records", metrics.votes.clone());
        registry.register("finalized", "items finalized", metrics.finalized.clone());
        registry.register("invalidated", "items invalidated", metrics.invalidated.clone());
        registry.register("records", "open vote records", metrics.records.clone());
        registry.register(
            "quorum",
            "whether the quorum is established",
            metrics.quorum.clone(),
        );
        metrics
    }
}
