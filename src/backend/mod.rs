//! Backend pool: records, registry and the init worker.

pub mod init_worker;
pub mod record;
pub mod registry;

pub use init_worker::InitWorker;
pub use record::{BackendId, BackendRecord, BackendSnapshot, BackendStatus};
pub use registry::{BackendRegistry, RefreshEvent};
