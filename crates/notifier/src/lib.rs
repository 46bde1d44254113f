//! Push gateway senders.
//!
//! - `apns`: Apple Push Notification service over HTTP/2, one request per token
//! - `gcm`: Google Cloud Messaging / FCM legacy HTTP API, multicast in chunks

pub mod apns;
pub mod gcm;

pub use apns::{ApnsConfig, ApnsSender};
pub use gcm::{GcmConfig, GcmSender};
