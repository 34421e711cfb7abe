pub mod event_manager;
pub mod firestore_client;
mod online_state;
pub mod query;
pub mod sync_engine;
mod target;
pub mod view;
pub mod view_snapshot;

pub use event_manager::{
    EventManager, ListenOptions, ListenSource, ListenerId, QueryListener, QueryObserver,
};
pub use firestore_client::{ClientSettings, FirestoreClient, ListenerRegistration};
pub use online_state::OnlineState;
pub use query::{Bound, FieldFilter, FilterOperator, LimitType, OrderBy, OrderDirection, Query};
pub use sync_engine::{LimboState, SyncEngine, SyncEngineListener, WriteCompletion};
pub use target::{Target, TargetId, TargetIdGenerator};
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot};
