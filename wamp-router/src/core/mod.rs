pub mod cancel;
pub mod close;
pub mod error;
pub mod id;
pub mod invocation_policy;
pub mod match_policy;
pub mod options;
pub mod peer_info;
pub mod roles;
pub mod service;
pub mod stream;
pub mod types;
pub mod uri;
