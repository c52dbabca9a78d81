pub mod cfg;
pub mod fixpoint;
pub mod lattice;
pub mod ordering;
pub mod policy;
pub mod state;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;
