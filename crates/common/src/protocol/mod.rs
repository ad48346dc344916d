// Wire formats shared by the client and any backend implementation.

pub mod mutation;
pub mod shape;
