//! Host bridge protocol: wire format, payload records and the transaction
//! engine.

pub mod engine;
pub mod pending;
pub mod records;
pub mod wire;

pub use engine::{TransactionContext, TransactionEngine};
pub use pending::PendingOperation;
pub use records::{
    encode_conn_status, ListenRecord, NetworkStatus, CONN_STATUS_SIZE, LISTEN_RECORD_SIZE,
    NETWORK_STATUS_SIZE,
};
pub use wire::{
    pack_words, unpack_words, word_count, Command, EnterpriseOp, RequestHeader, ResponseCode,
    ResponseHeader, FLAG_CLOSE_AFTER_WRITE, FLAG_PUSH, FORMAT_VERSION, HEADER_WORDS,
    HOST_NAME_LENGTH, MAX_CONNECTIONS, MAX_DATA_LENGTH, MAX_TX_POWER,
};
