//! Domain types for the laundry point of sale.
//!
//! `ncf` owns tax receipt ranges and the allocator that issues numbers from
//! them; `order` holds the order lifecycle that consumes those numbers on
//! delivery. Persistence lives in the storage crate behind [`ncf::RangeLedger`].
pub mod ncf;
pub mod order;
