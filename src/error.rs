//! Error types for ndproxyd.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config: {0}")]
    Config(String),

    #[error("interface {name}: {source}")]
    Iface {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("netlink: {0}")]
    Netlink(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
