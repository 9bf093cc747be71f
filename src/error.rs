use crate::PhashId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Heed(#[from] heed::Error),

    #[error("Database `{0}` is missing, the index must be created before it is opened")]
    MissingDatabase(&'static str),

    #[error("Perceptual hash {phash_id} does not exist")]
    PhashNotFound { phash_id: PhashId },

    #[error("The tree is corrupted around node {phash_id}, regenerate it to recover")]
    CorruptedTree { phash_id: PhashId },

    #[error("The maximum number of perceptual hash ids has been reached")]
    DatabaseFull,

    #[error("The maintenance operation was cancelled")]
    MaintenanceCancelled,
}
