//! Road-network topology and graph attention encoders

mod conv;
mod edge_index;
mod encoder;

pub use conv::GatConv;
pub use edge_index::EdgeIndex;
pub use encoder::{Activation, GraphEncoder, GraphEncoderKind, HyperbolicGraphEncoder, PRELU_INIT};
