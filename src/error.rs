use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum DiskError {
    #[error("card removed")]
    CardRemoved,
    #[error("no volume mounted")]
    NotMounted,
    #[error("file not found")]
    NotFound,
    #[error("root directory is full")]
    DirectoryFull,
    #[error("not enough free clusters")]
    NoFreeClusters,
    #[error("cluster chain ends at position {0}")]
    BadChain(u16),
    #[error("malformed disk field")]
    BadField,
}

pub type Result<T> = core::result::Result<T, DiskError>;
