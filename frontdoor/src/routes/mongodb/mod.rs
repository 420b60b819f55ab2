pub(crate) mod remove;
pub(crate) mod test;
