pub(crate) mod jobs;
pub(crate) mod submissions;
pub(crate) mod tasks;
