pub mod algorithms;
pub mod bundle;
pub mod cancellation;
pub mod fs;
pub mod time;

pub use async_trait::async_trait;
pub use cancellation::CancellationToken;

pub mod errors {
    pub use failure::err_msg;
    pub use failure::format_err;
    pub use failure::Error;

    pub type Result<T> = std::result::Result<T, Error>;
}

pub mod bytes {
    pub use bytes::Bytes;
}
