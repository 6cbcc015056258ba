pub mod template;
pub mod v9;
