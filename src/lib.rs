pub mod cavity;
pub mod client;
pub mod configs;
pub mod fitting;
pub mod logger;
pub mod motor;
pub mod motors;
pub mod util;
