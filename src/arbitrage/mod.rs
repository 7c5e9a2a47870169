pub mod builder;
pub mod decider;
pub mod executor;
pub mod fees;
pub mod jito_client;
pub mod scanner;
pub mod scheduler;
pub mod stats;
pub mod trigger;

use serde::Serialize;

use crate::aggregator::{JupiterQuote, OpenOceanQuote, UltraOrder};

/// Outcome of the profitability check for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub profit: i128,
    pub conservative_profit: i128,
    pub profitable: bool,
}

/// Fields shared by every candidate shape. Compute-budget values are the
/// resolved per-pair ones so the executor builds with what was priced.
#[derive(Debug, Clone)]
pub struct CandidateCore {
    pub pair_name: String,
    pub amount_in: u128,
    pub tip_lamports: u64,
    pub fee_lamports: u64,
    pub fee_in_a: u128,
    pub cu_limit: u32,
    pub cu_price_micro_lamports: u64,
    pub decision: Decision,
}

/// One leg quoted on the primary aggregator: either a plain quote (swap
/// provider) or an Ultra order carrying its pre-built transaction.
#[derive(Debug, Clone)]
pub enum PrimaryLeg {
    Quote(JupiterQuote),
    Ultra(UltraOrder),
}

impl PrimaryLeg {
    pub fn out_amount(&self) -> u128 {
        match self {
            PrimaryLeg::Quote(q) => q.out_amount,
            PrimaryLeg::Ultra(o) => o.out_amount,
        }
    }

    pub fn min_out_amount(&self) -> u128 {
        match self {
            PrimaryLeg::Quote(q) => q.other_amount_threshold,
            PrimaryLeg::Ultra(o) => o.other_amount_threshold,
        }
    }

    pub fn is_ultra(&self) -> bool {
        matches!(self, PrimaryLeg::Ultra(_))
    }
}

/// A fully priced round trip, ready for the profitability decision and,
/// when profitable, execution.
#[derive(Debug, Clone)]
pub enum Candidate {
    Loop {
        core: CandidateCore,
        leg1: PrimaryLeg,
        leg2: PrimaryLeg,
    },
    LoopSecondary {
        core: CandidateCore,
        quote1: OpenOceanQuote,
        quote2: OpenOceanQuote,
    },
    Triangular {
        core: CandidateCore,
        quote1: JupiterQuote,
        quote2: JupiterQuote,
        quote3: JupiterQuote,
    },
}

impl Candidate {
    pub fn core(&self) -> &CandidateCore {
        match self {
            Candidate::Loop { core, .. }
            | Candidate::LoopSecondary { core, .. }
            | Candidate::Triangular { core, .. } => core,
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            Candidate::LoopSecondary { .. } => "openocean",
            _ => "jupiter",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Candidate::Loop { leg1, .. } if leg1.is_ultra() => "ultra",
            Candidate::Loop { .. } => "loop",
            Candidate::LoopSecondary { .. } => "loop-secondary",
            Candidate::Triangular { .. } => "triangular",
        }
    }

    /// Conservative output of the final leg.
    pub fn final_min_out(&self) -> u128 {
        match self {
            Candidate::Loop { leg2, .. } => leg2.min_out_amount(),
            Candidate::LoopSecondary { quote2, .. } => quote2.min_out_amount,
            Candidate::Triangular { quote3, .. } => quote3.other_amount_threshold,
        }
    }
}
