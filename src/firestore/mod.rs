pub mod core;
mod constants;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod util;
pub mod value;

#[cfg(test)]
pub(crate) mod test_support;

pub use self::core::{
    ClientSettings, FirestoreClient, ListenOptions, ListenSource, ListenerRegistration, Query,
    QueryObserver, ViewSnapshot,
};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
