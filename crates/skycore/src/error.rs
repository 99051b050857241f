//! Engine errors.

use thiserror::Error;

use crate::ConnId;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("No connection with id {0}")]
    NoSuchConnection(ConnId),
    #[error("Connection {0} is not deletable while it holds priority")]
    NotDeletable(ConnId),
}
