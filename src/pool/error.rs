/// Error raised when a connection cannot be obtained from the [`ConnectionPool`](super::ConnectionPool).
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct Error(#[from] anyhow::Error);

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Self(err.into())
    }
}

impl From<deadpool::managed::PoolError<Error>> for Error {
    fn from(err: deadpool::managed::PoolError<Error>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => e,
            err => Self(anyhow::Error::new(err).context("Failed to get a RabbitMq connection from the pool")),
        }
    }
}
