// fieldsync-common: shared types and wire protocol for fieldsync crates

pub mod protocol;
pub mod types;
