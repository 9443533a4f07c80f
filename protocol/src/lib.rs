pub mod channel;
pub mod logging;
pub mod sync;
pub mod tariff;
