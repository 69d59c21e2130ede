pub mod codec;
pub mod envelope;
pub mod payload;

pub use codec::{decode_canonical, encode_canonical, CodecError};
pub use envelope::{IdempotencyKey, MessageId, RecordId, TransferAck, TransferSubmission};
pub use payload::{Classification, PayloadError, PropertyTransfer, QueuePayload};
