pub mod call_serializer;
pub mod nonce_authority;
pub mod nonce_store;

pub use call_serializer::{CallSerializer, SerializerStats};
pub use nonce_authority::{Nonce, NonceAuthority, NonceClock, NonceConfig, NonceStats, SystemClock};
pub use nonce_store::{FileNonceStore, MemoryNonceStore, NonceStore, PostgresNonceStore};
