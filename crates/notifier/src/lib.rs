pub mod breaker;
pub mod cache;
pub mod downstream;
pub mod render;
pub mod sender;
pub mod template;
pub mod worker;
