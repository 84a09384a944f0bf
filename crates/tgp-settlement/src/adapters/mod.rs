pub mod internal;

pub use internal::InternalLedger;
