pub mod db;
pub mod expand;
pub mod optimize;
pub mod resume;
pub mod run;
pub mod shared;
pub mod stats;
pub mod validate;
