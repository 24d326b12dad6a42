use std::fmt;

use chrono::{DateTime, Utc};

use crate::model::NewCommand;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// Fewer than the three `_` separated fields.
    Malformed(String),
    NoBotIds(String),
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::Malformed(payload) => write!(f, "illegal message: {}", payload),
            SignalError::NoBotIds(payload) => write!(f, "no bot ids in message: {}", payload),
        }
    }
}

/// Parses `botid[&botid...]_PAIR_COMMAND[_PERCENT%]` into one pending
/// command per bot id, all stamped with `now`.
pub fn parse_signal(payload: &str, now: DateTime<Utc>) -> Result<Vec<NewCommand>, SignalError> {
    let trimmed = payload.trim();
    let fields: Vec<&str> = trimmed.split('_').map(str::trim).collect();
    if fields.len() < 3 || fields[1].is_empty() || fields[2].is_empty() {
        return Err(SignalError::Malformed(trimmed.to_string()));
    }

    let bot_ids: Vec<&str> = fields[0].split('&').map(str::trim).filter(|id| !id.is_empty()).collect();
    if bot_ids.is_empty() {
        return Err(SignalError::NoBotIds(trimmed.to_string()));
    }

    let percent = fields
        .get(3)
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string());

    Ok(bot_ids
        .into_iter()
        .map(|bot_id| NewCommand {
            bot_id: bot_id.to_string(),
            pair: fields[1].to_string(),
            command: fields[2].to_string(),
            percent: percent.clone(),
            created_at: now,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_bot() {
        let now = Utc::now();
        let commands = parse_signal("7_BTCUSDT_enter-long", now).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].bot_id, "7");
        assert_eq!(commands[0].pair, "BTCUSDT");
        assert_eq!(commands[0].command, "enter-long");
        assert_eq!(commands[0].percent, None);
        assert_eq!(commands[0].created_at, now);
    }

    #[test]
    fn test_fan_out_with_percent() {
        let commands = parse_signal("1&2&3_ETHUSDT_take-profit-long-2_5%", Utc::now()).unwrap();
        let ids: Vec<_> = commands.iter().map(|c| c.bot_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert!(commands.iter().all(|c| c.percent.as_deref() == Some("5%")));
    }

    #[test]
    fn test_illegal_messages() {
        assert!(matches!(
            parse_signal("7_BTCUSDT", Utc::now()),
            Err(SignalError::Malformed(_))
        ));
        assert!(matches!(
            parse_signal("&_BTCUSDT_exit-long", Utc::now()),
            Err(SignalError::NoBotIds(_))
        ));
    }
}
