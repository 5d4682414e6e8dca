pub mod archive;
pub mod encryptor;
pub mod keys;
pub mod locks;
pub mod metadata;
pub mod models;
pub mod pipeline;
pub mod poller;
pub mod state;

pub use encryptor::{ChunkEncryptor, StagedPart};
pub use locks::TransferLocks;
pub use models::{
    Artifact, Document, DocumentUpload, FilePart, FormCode, JpkType, NewDocument, NewFilePart,
    NewTransfer, SlotAssignment, Transfer, TransferMessage,
};
pub use pipeline::TransferPipeline;
pub use poller::{PollOutcome, PollSummary, StatusPoller};
pub use state::{TransferState, Transition};
