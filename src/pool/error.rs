use crate::Error;
use deadpool::managed::PoolError;

impl From<PoolError<Error>> for Error {
    fn from(err: PoolError<Error>) -> Self {
        match err {
            PoolError::Backend(e) => e,
            err => Self::Pool(anyhow::anyhow!("Failed to get a pooled connection: {err}")),
        }
    }
}
