pub(crate) mod job;
pub(crate) mod journal;
pub(crate) mod manager;
pub(crate) mod preview;
pub(crate) mod process;
pub(crate) mod renderer;
