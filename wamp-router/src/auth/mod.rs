pub mod auth_method;
pub mod identity;
pub mod security;
