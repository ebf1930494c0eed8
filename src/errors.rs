use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::status::DriverStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("out of packet resources")]
    OutOfResources,
    #[error("empty buffer chain")]
    EmptyChain,
    #[error("adapter not initialized")]
    AdapterNotReady,
    #[error("driver did not complete {op} request within {timeout:?}")]
    RequestTimeout {
        op: &'static str,
        timeout: Duration,
    },
    #[error("driver returned {0}")]
    Driver(DriverStatus),
    #[error("{0}")]
    Generic(#[from] io::Error),
}
