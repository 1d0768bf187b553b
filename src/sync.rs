#[cfg(feature = "loom")]
pub(crate) use loom::sync;

#[cfg(not(feature = "loom"))]
pub(crate) use std::sync;

pub(crate) use tokio::sync::Notify;
