//! Geometry primitives shared by every contrastive loss

mod poincare;
mod transport;

pub use poincare::{check_ball, hyperbolic_distance, PoincareBall, BALL_EPS};
pub use transport::{ground_cost, SinkhornDivergence, TransportReduction};
