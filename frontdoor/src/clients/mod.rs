pub mod docker;
pub mod openssl;
pub mod proxy_admin;
