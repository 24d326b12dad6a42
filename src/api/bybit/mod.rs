pub mod api;
pub mod auth;
pub mod cancel_all_orders;
pub mod client;
pub mod get_balance;
pub mod get_instruments;
pub mod get_position;
pub mod get_tickers;
pub mod send_order;
pub mod set_leverage;
pub mod switch_isolated;
pub mod trading_stop;
