pub mod kline;
pub mod protocol;
pub mod rate_limit;
pub mod rest;
pub mod stream;

pub use kline::{kline_topic, parse_kline_data, symbol_from_topic, KlineUpdate};
pub use rate_limit::RateLimiter;
pub use rest::BybitClient;
pub use stream::{
    Connector, StreamConfig, StreamTransport, TopicHandler, TungsteniteConnector, WsSink, WsSource,
};
