pub mod alm;
pub mod bfgs;

pub use alm::AugmentedLagrangian;
pub use bfgs::ProjectedBfgs;
