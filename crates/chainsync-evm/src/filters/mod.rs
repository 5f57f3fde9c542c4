//! Filter chain stages for EVM transactions.

pub mod address;
pub mod transfer;

pub use address::AddressFilter;
pub use transfer::TransferFilter;
