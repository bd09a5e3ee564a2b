//! JSON messages exchanged with the proxy.

use std::collections::HashMap;

use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{Map, Number, Value};
use tracing::warn;

/// Sent back after every message handled while streaming results.
pub const ACKNOWLEDGMENT: &str = "Received";
/// Asks the proxy to forget the current game and accept a new supervisor handshake.
pub const RESET: &str = "Reset";

/// Status a bot reached at the end of a game, as reported by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum BotStatus {
    /// Won the game.
    Victory,
    /// Lost the game.
    Defeat,
    /// Draw.
    Tie,
    /// The bot process crashed or left.
    Crash,
    /// The bot exceeded its step time budget.
    Timeout,
    /// The game client itself crashed.
    SC2Crash,
    /// The bot never managed to join the game.
    InitializationError,
    /// Anything the runner does not know about.
    #[serde(other)]
    Unknown,
}

/// `Result` field of an outcome message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum GameOutcome {
    /// Per bot statuses.
    PerBot(HashMap<String, BotStatus>),
    /// Literal value, `"Error"` short-circuits the interpretation.
    Literal(String),
}

impl GameOutcome {
    /// Status of `bot`, [`BotStatus::Unknown`] when missing.
    pub fn status_of(&self, bot: &str) -> BotStatus {
        match self {
            GameOutcome::PerBot(statuses) => {
                statuses.get(bot).copied().unwrap_or(BotStatus::Unknown)
            }
            GameOutcome::Literal(_) => BotStatus::Unknown,
        }
    }

    /// True for the literal `"Error"` outcome.
    pub fn is_error(&self) -> bool {
        matches!(self, GameOutcome::Literal(s) if s == "Error")
    }
}

/// One inbound JSON message from the proxy.
///
/// Every known key is read on its own: a field of an unexpected type is logged and ignored
/// without hiding the other fields of the message.
#[derive(Debug, Default)]
pub struct ProxyMessage {
    status: Option<String>,
    config: Option<String>,
    bot: Option<String>,
    result: Option<GameOutcome>,
    game_time: Option<u64>,
    game_time_formatted: Option<String>,
    average_frame_time: Option<HashMap<String, f64>>,
    time_stamp: Option<String>,
    has_error: bool,
}

fn field<T: DeserializeOwned>(object: &mut Map<String, Value>, key: &str) -> Option<T> {
    let value = object.remove(key).filter(|v| !v.is_null())?;
    match serde_json::from_value(value) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("ignoring field '{key}': {e}");
            None
        }
    }
}

/// Game loops, accepting integral numbers written as floats.
fn game_loops(number: &Number) -> Option<u64> {
    number.as_u64().or_else(|| {
        number
            .as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0)
            .map(|f| f as u64)
    })
}

impl ProxyMessage {
    /// Parse a text frame. Only text that is not a JSON object is rejected.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let mut object: Map<String, Value> = serde_json::from_str(text)?;

        let game_time = field::<Number>(&mut object, "GameTime").and_then(|n| {
            let loops = game_loops(&n);
            if loops.is_none() {
                warn!("ignoring field 'GameTime': {n} is not a number of game loops");
            }
            loops
        });
        let average_frame_time = field::<Map<String, Value>>(&mut object, "AverageFrameTime")
            .map(|frames| {
                frames
                    .into_iter()
                    .filter_map(|(bot, time)| time.as_f64().map(|time| (bot, time)))
                    .collect()
            });

        Ok(Self {
            status: field(&mut object, "Status"),
            config: field(&mut object, "Config"),
            bot: field(&mut object, "Bot"),
            result: field(&mut object, "Result"),
            game_time,
            game_time_formatted: field(&mut object, "GameTimeFormatted"),
            average_frame_time,
            time_stamp: field(&mut object, "TimeStamp"),
            has_error: object.contains_key("Error"),
        })
    }

    /// `{"Status":"Connected"}`
    pub fn is_connected_status(&self) -> bool {
        self.status.as_deref() == Some("Connected")
    }

    /// `{"Status":"Complete"}`
    pub fn is_complete(&self) -> bool {
        self.status.as_deref() == Some("Complete")
    }

    /// `{"Config":"Received"}`
    pub fn is_config_received(&self) -> bool {
        self.config.as_deref() == Some("Received")
    }

    /// `{"Bot":"Connected"}`
    pub fn is_bot_connected(&self) -> bool {
        self.bot.as_deref() == Some("Connected")
    }

    /// The message carries an `Error` key, whatever its value.
    pub fn has_error(&self) -> bool {
        self.has_error
    }

    /// The message carries something the result interpreter consumes.
    pub fn carries_result(&self) -> bool {
        self.result.is_some() || self.game_time.is_some() || self.average_frame_time.is_some()
    }

    /// `Result` field.
    pub fn outcome(&self) -> Option<&GameOutcome> {
        self.result.as_ref()
    }

    /// Game loops played.
    pub fn game_time(&self) -> Option<u64> {
        self.game_time
    }

    /// Game time as `HH:MM:SS`.
    pub fn game_time_formatted(&self) -> Option<&str> {
        self.game_time_formatted.as_deref()
    }

    /// Average step time per bot.
    pub fn average_frame_time(&self) -> Option<&HashMap<String, f64>> {
        self.average_frame_time.as_ref()
    }

    /// Completion time stamp set by the proxy.
    pub fn time_stamp(&self) -> Option<&str> {
        self.time_stamp.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_messages() {
        assert!(ProxyMessage::parse(r#"{"Status": "Connected"}"#)
            .unwrap()
            .is_connected_status());
        assert!(ProxyMessage::parse(r#"{"Config": "Received"}"#)
            .unwrap()
            .is_config_received());
        assert!(ProxyMessage::parse(r#"{"Bot": "Connected"}"#)
            .unwrap()
            .is_bot_connected());
        assert!(!ProxyMessage::parse(r#"{"Bot": "Disconnected"}"#)
            .unwrap()
            .is_bot_connected());
    }

    #[test]
    fn error_key_with_any_value() {
        let msg = ProxyMessage::parse(r#"{"Error": null}"#).unwrap();
        assert!(msg.has_error());
        assert!(!msg.carries_result());
        let msg = ProxyMessage::parse(r#"{"Error": {"Reason": "crashed"}}"#).unwrap();
        assert!(msg.has_error());
    }

    #[test]
    fn outcome_payload() {
        let msg = ProxyMessage::parse(
            r#"{"Result":{"BotA":"Victory","BotB":"Whatever"},"GameTime":500,"GameTimeFormatted":"00:08:20"}"#,
        )
        .unwrap();
        assert!(msg.carries_result());
        let outcome = msg.outcome().unwrap();
        assert_eq!(outcome.status_of("BotA"), BotStatus::Victory);
        assert_eq!(outcome.status_of("BotB"), BotStatus::Unknown);
        assert_eq!(outcome.status_of("BotC"), BotStatus::Unknown);
        assert_eq!(msg.game_time(), Some(500));
        assert_eq!(msg.game_time_formatted(), Some("00:08:20"));
    }

    #[test]
    fn literal_error_outcome() {
        let msg = ProxyMessage::parse(r#"{"Result":"Error"}"#).unwrap();
        assert!(msg.outcome().unwrap().is_error());
    }

    #[test]
    fn float_game_time_is_kept() {
        let msg = ProxyMessage::parse(
            r#"{"Result":{"BotA":"Victory","BotB":"Defeat"},"GameTime":500.0}"#,
        )
        .unwrap();
        assert_eq!(msg.game_time(), Some(500));
        assert_eq!(msg.outcome().unwrap().status_of("BotA"), BotStatus::Victory);
    }

    #[test]
    fn mistyped_field_does_not_hide_the_others() {
        let msg = ProxyMessage::parse(r#"{"Error":"crashed","GameTime":"late"}"#).unwrap();
        assert!(msg.has_error());
        assert_eq!(msg.game_time(), None);

        let msg = ProxyMessage::parse(
            r#"{"Result":{"BotA":"Defeat","BotB":"Victory"},"GameTime":-3,"TimeStamp":7}"#,
        )
        .unwrap();
        assert!(msg.carries_result());
        assert_eq!(msg.outcome().unwrap().status_of("BotB"), BotStatus::Victory);
        assert_eq!(msg.game_time(), None);
        assert_eq!(msg.time_stamp(), None);
    }

    #[test]
    fn bad_frame_time_entry_is_skipped() {
        let msg =
            ProxyMessage::parse(r#"{"AverageFrameTime":{"BotA":2.5,"BotB":"slow"}}"#).unwrap();
        let frames = msg.average_frame_time().unwrap();
        assert_eq!(frames.get("BotA"), Some(&2.5));
        assert_eq!(frames.get("BotB"), None);
    }

    #[test]
    fn plain_text_is_rejected() {
        assert!(ProxyMessage::parse("Reset").is_err());
        assert!(ProxyMessage::parse("[1, 2]").is_err());
    }
}
