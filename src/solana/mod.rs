pub mod priority;
pub mod rpc;
pub mod wallet;

pub use priority::PriorityFeeEstimator;
pub use rpc::SolanaRpcClient;
pub use wallet::{load_keypair, setup_wallet};
