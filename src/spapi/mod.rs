pub mod client;
pub mod signer;

pub use client::{Region, SpApiClient};
