//! Row data consumed by the predictor.
//!
//! Two families of input are supported:
//!
//! - [`DataSource`]: a sequence of [`SparsePage`]s, each a CSR batch of
//!   [`Entry`] rows with a base row id. [`SparseDataset`] is the in-memory
//!   implementation.
//! - [`Adapter`]: an external layout read row by row without building a
//!   page. [`InplaceInput`] enumerates the adapters accepted by in-place
//!   prediction.
//!
//! # Missing Values
//!
//! Missing values are represented as `f32::NAN`. Adapters may also carry a
//! caller-chosen sentinel which is filtered on conversion.

mod adapter;
mod dataset;
mod page;

pub use adapter::{Adapter, ArrayAdapter, CsrAdapter, CsrIndex, DenseAdapter, InplaceInput};
pub use dataset::{DataSource, SparseDataset};
pub use page::{Entry, SparsePage};
