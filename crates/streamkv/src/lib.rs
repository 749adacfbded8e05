//! Stream facade over a callback-driven transactional key-value host.
//!
//! Host operations are described cold ([`Request`], [`Cursor`]) and run only
//! when subscribed. Each subscription is a `futures::Stream` of
//! `Result<_, StoreError>`; dropping it unsubscribes.

pub mod cursor;
pub mod database;
pub mod error;
pub mod events;
pub mod host;
pub mod index;
pub mod key;
pub mod object_store;
pub mod open;
pub mod request;
mod source;
pub mod transaction;
pub mod transformer;

pub use cursor::{Cursor, CursorOptions, CursorStream, KeyRow, Row};
pub use database::Database;
pub use error::{ErrorKind, StoreError, StoreResult};
pub use events::{
    Event, EventSource, EventStream, EventTarget, EventType, Listener, ListenerOptions, listener,
};
pub use host::{
    CursorDirection, DatabaseInfo, HostFactory, HostValue, IndexParameters, ObjectStoreParameters,
    TransactionMode, TransactionState,
};
pub use index::Index;
pub use key::{Key, KeyPath, KeyRange};
pub use object_store::ObjectStore;
pub use open::{
    DatabaseOptions, IndexSchema, SchemaVersion, StoreSchema, apply_schema, delete_database,
    list_databases, open_database,
};
pub use request::{Request, RequestStream};
pub use transaction::Transaction;
pub use transformer::{FnTransformer, Identity, Json, Transformer};
