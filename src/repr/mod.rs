//! Model representations consumed by the predictor.

pub mod gbdt;
