pub mod client;
pub mod repository;

pub use client::EtcdClient;
pub use repository::{EtcdRepository, HasId};
