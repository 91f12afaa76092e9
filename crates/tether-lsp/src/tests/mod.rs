//! Session and supervisor tests driven by an in-process language server.

pub(crate) mod support;
