//! Sequence encoder, dual-view model, augmentation and contrastive losses

mod augment;
mod loss;
mod model;
mod positional;
mod transformer;

pub use augment::{dropout, random_mask};
pub use loss::{build_positive_mask, node_node_loss, ContrastiveObjective, LossBreakdown, LossMeasure};
pub use model::{DualViewModel, LookupMode, NODE_EMBEDDING};
pub use positional::{PositionalEncoding, DEFAULT_MAX_LEN};
pub use transformer::{masked_mean_pool, MultiHeadSelfAttention, SequenceEncoder, TransformerEncoderLayer};
