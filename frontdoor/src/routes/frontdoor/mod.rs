pub(crate) mod add_app;
pub(crate) mod add_subdomain;
pub(crate) mod config;
