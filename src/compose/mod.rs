pub(crate) mod fingerprint;
pub(crate) mod resolver;
pub(crate) mod spec;
