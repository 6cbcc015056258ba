pub mod dispatch;
pub mod listener;
pub mod output;
pub mod parser;
pub mod prometheus;
