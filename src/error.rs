use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WheelError {
    #[error("tick resolution must be greater than zero")]
    ZeroTick,

    #[error("wheel thread name must not be empty")]
    EmptyThreadName,

    #[error("failed to start the wheel thread")]
    Spawn(#[from] io::Error),
}
