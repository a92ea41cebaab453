pub mod elog;

pub use elog::ElogSource;
