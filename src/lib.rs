pub mod error;
pub mod nand;
pub mod ubi;
