pub mod record;

pub use record::{
    BaseKeyType, IndexInfo, PendingPreKey, ReceivingChain, SendingChain, Session, SessionRecord,
    SkippedKey,
};
