pub mod hash;
pub mod hex;
