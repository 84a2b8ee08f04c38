//! courier-e2ee: the end-to-end encryption pipeline on top of courier-crypto
//!
//! - [`KeyExchange`]: peer key material from the backend, cached per session
//! - [`MessageCipher`]: direct and group message envelopes
//! - [`StreamingUploadCoordinator`]: encrypt-and-upload, one chunk at a time
//! - [`E2eeSession`]: ties the above to one signed-in device
//!
//! Network and thumbnail collaborators are traits in [`backend`];
//! [`HttpBackend`] is the REST implementation.

pub mod backend;
pub mod exchange;
pub mod http;
pub mod message;
pub mod session;
pub mod upload;

pub use backend::{
    ChunkAck, FinalizeMetadata, FinalizeRequest, FinalizeResponse, InitUploadRequest,
    InitUploadResponse, KeyDirectory, NoThumbnails, Thumbnail, ThumbnailGenerator, UploadService,
};
pub use exchange::KeyExchange;
pub use http::HttpBackend;
pub use message::{GroupEncryption, MessageCipher};
pub use session::E2eeSession;
pub use upload::{shared_file_material, StreamingUploadCoordinator, UploadOutcome};
