//! Hash join over offset-addressed data stores, executed as data-parallel
//! work-groups on host threads.
//!
//! A join runs in two launches. [`gpuhashjoin_main`] probes every outer row
//! against a [`MultiHashTable`] and writes combinations of row references
//! into the request's result buffer. One of the projection kernels then
//! turns those combinations into rows of a destination [`DataStore`].

pub mod data_store;
pub mod device;
pub mod error;
pub mod execute;
pub mod hashkey;
pub mod layout;
pub mod multihash;
pub mod project_row;
pub mod project_slot;
pub mod request;
pub mod strategy;
pub mod tuple;
pub mod varlena;

pub use data_store::{DataStore, StoreFormat};
pub use device::LaunchConfig;
pub use error::{ErrorCode, JoinError, LayoutError, Result};
pub use execute::gpuhashjoin_main;
pub use multihash::{HashTableBuilder, MultiHashBuilder, MultiHashTable};
pub use project_row::gpuhashjoin_projection_row;
pub use project_slot::gpuhashjoin_projection_slot;
pub use request::{HashJoinRequest, ParamBuf, ResultBuffer, RowMap};
pub use strategy::{EquiJoin, JoinStrategy, KeyPair};
pub use tuple::ColumnMeta;
