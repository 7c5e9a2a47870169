pub mod pairs;
pub mod settings;

pub use pairs::{load_pairs, parse_pairs, PairConfig};
pub use settings::{
    AmountMode, ExecutionProvider, ExecutionStrategy, Mode, PriorityFeeStrategy, Profile,
    Settings, TipMode, TriggerStrategyKind, UpstreamRateSettings,
};
