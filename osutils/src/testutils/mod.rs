pub mod fake_host;
pub mod mock;
