//! Banded, dense, and sparse matrix storage tailored to the block structure
//! of the discretized general rate model Jacobian.

pub mod band;
pub mod dense;
pub mod sparse;

pub use band::{BandMatrix, FactorizableBandMatrix};
pub use dense::DenseSlab;
pub use sparse::SparseCoupling;
