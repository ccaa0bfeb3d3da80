use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketStreamError {
    #[error("Malformed market data payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("Unknown symbol: {symbol}")]
    UnknownSymbol { symbol: String },

    #[error("Invalid topic: {topic}")]
    InvalidTopic { topic: String },

    #[error("Invalid base price for {symbol}: {price}, must be between 1.00 and 1000000000.00")]
    InvalidBasePrice { symbol: String, price: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MarketStreamError>;
