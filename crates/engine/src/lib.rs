pub mod cursor;
pub mod dispatcher;
pub mod grouping;
pub mod hook;
pub mod memory;
pub mod orchestrator;
pub mod pg;
pub mod records;
pub mod service;
pub mod store;

pub use cursor::{RecipientBatch, RecipientCursor};
pub use dispatcher::{ChannelDispatcher, ChannelResult, DispatchError, collect_tokens};
pub use grouping::group_by_device;
pub use hook::{FanoutHook, NotificationSaved};
pub use orchestrator::{FanoutOrchestrator, RunOptions, RunState, RunSummary};
pub use records::DeliveryRecordWriter;
pub use service::{NotificationService, SaveOptions};
