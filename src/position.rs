use std::fmt;

use crate::api::bybit::api::ApiResponseError;
use crate::exchange::{Exchange, MarketInfo, PositionInfo};
use crate::model::{OrderSide, PositionSnapshot, Side};

#[derive(Debug)]
pub enum PositionError {
    Exchange(ApiResponseError),
    /// Both a long and a short row are open on the same symbol.
    BothSidesOpen(String),
}

impl fmt::Display for PositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionError::Exchange(e) => write!(f, "{}", e),
            PositionError::BothSidesOpen(symbol) => {
                write!(f, "error getting active positions: both sides open on {}", symbol)
            }
        }
    }
}

impl From<ApiResponseError> for PositionError {
    fn from(e: ApiResponseError) -> Self {
        PositionError::Exchange(e)
    }
}

/// Folds the raw position rows of one symbol into a snapshot.
pub fn summarize(
    symbol: &str,
    rows: &[PositionInfo],
    current_price: f64,
) -> Result<PositionSnapshot, PositionError> {
    let open = |side: OrderSide| {
        rows.iter()
            .find(|row| row.side == Some(side) && row.size != 0.0)
    };

    let build = |side: Side, row: &PositionInfo| PositionSnapshot {
        side: Some(side),
        quantity: row.size,
        stop_loss: row.stop_loss,
        entry_price: row.entry_price,
        current_price,
        unrealized_pnl: row.unrealized_pnl,
        leverage: row.leverage,
    };

    match (open(OrderSide::Buy), open(OrderSide::Sell)) {
        (None, None) => Ok(PositionSnapshot::flat(current_price)),
        (Some(buy), None) => Ok(build(Side::Long, buy)),
        (None, Some(sell)) => Ok(build(Side::Short, sell)),
        (Some(_), Some(_)) => Err(PositionError::BothSidesOpen(symbol.to_string())),
    }
}

/// Current position and last price of `symbol`.
pub async fn snapshot<E: Exchange>(
    exchange: &E,
    symbol: &str,
) -> Result<PositionSnapshot, PositionError> {
    let current_price = exchange.last_price(symbol).await?;
    let rows = exchange.positions(symbol).await?;
    summarize(symbol, &rows, current_price)
}

/// Resolves a signal pair to its market and current position.
pub async fn resolve<E: Exchange>(
    exchange: &E,
    pair: &str,
) -> Result<(MarketInfo, PositionSnapshot), PositionError> {
    let market = exchange.resolve_symbol(pair).await?;
    let position = snapshot(exchange, &market.symbol).await?;
    Ok((market, position))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(side: Option<OrderSide>, size: f64, entry: f64) -> PositionInfo {
        PositionInfo {
            side,
            size,
            stop_loss: 0.0,
            unrealized_pnl: 1.5,
            entry_price: entry,
            leverage: 5.0,
        }
    }

    #[test]
    fn test_flat_when_no_rows() {
        let s = summarize("BTCUSDT", &[], 100.0).unwrap();
        assert!(!s.is_open());
        assert_eq!(s.current_price, 100.0);
    }

    #[test]
    fn test_zero_size_rows_are_flat() {
        let rows = vec![row(Some(OrderSide::Buy), 0.0, 0.0), row(Some(OrderSide::Sell), 0.0, 0.0)];
        let s = summarize("BTCUSDT", &rows, 100.0).unwrap();
        assert_eq!(s.side, None);
    }

    #[test]
    fn test_long_position() {
        let rows = vec![row(Some(OrderSide::Buy), 2.0, 95.0), row(None, 0.0, 0.0)];
        let s = summarize("BTCUSDT", &rows, 100.0).unwrap();
        assert_eq!(s.side, Some(Side::Long));
        assert_eq!(s.quantity, 2.0);
        assert_eq!(s.entry_price, 95.0);
        assert_eq!(s.leverage, 5.0);
        assert_eq!(s.unrealized_pnl, 1.5);
    }

    #[test]
    fn test_short_position() {
        let rows = vec![row(Some(OrderSide::Buy), 0.0, 0.0), row(Some(OrderSide::Sell), 3.0, 105.0)];
        let s = summarize("BTCUSDT", &rows, 100.0).unwrap();
        assert_eq!(s.side, Some(Side::Short));
        assert_eq!(s.quantity, 3.0);
    }

    #[test]
    fn test_both_sides_is_an_error() {
        let rows = vec![row(Some(OrderSide::Buy), 1.0, 95.0), row(Some(OrderSide::Sell), 1.0, 105.0)];
        assert!(matches!(
            summarize("BTCUSDT", &rows, 100.0),
            Err(PositionError::BothSidesOpen(_))
        ));
    }
}
