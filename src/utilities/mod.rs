pub mod cyclic;
pub mod enums;
pub mod helpers;
pub mod matrix;

#[cfg(test)]
pub(crate) mod test_lattice;
