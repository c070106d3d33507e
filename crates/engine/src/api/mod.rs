pub mod binance;
pub mod paper;

pub use binance::BinanceClient;
pub use paper::{PaperExchange, SpotPriceSource};
