mod auth;
mod connection;
mod rest;

pub use auth::sign_request;
pub use connection::{
    CloseCategory, ConnectionManager, ConnectionPhase, ConnectionStatus, ExchangeEvent,
};
pub use rest::{ApiResponse, OrderRequest, Product, RestClient, TickerInfo};
